mod http_transport;
mod upstream;

pub use http_transport::HttpTransport;
pub use upstream::UpstreamClient;
