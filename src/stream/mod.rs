pub mod emitter;
pub mod frame;

pub use emitter::{encode_event, sse_response, EventEmitter, OutboundEvent};
pub use frame::{classify_frame, FrameBuffer, ProviderFrame, ProviderStream, StreamItem};
