pub mod chat;
pub mod health;
pub mod start;
pub mod stream;

pub use chat::chat_handler;
pub use health::health_handler;
pub use start::start_handler;
pub use stream::message_stream_handler;
