//! Client-facing event stream encoding.

use axum::response::Response;
use bytes::Bytes;
use serde::Serialize;

/// Event delivered to the browser on `/message/stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Content(String),
    Complete,
    Error(String),
}

impl OutboundEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Content(_) => "content",
            OutboundEvent::Complete => "complete",
            OutboundEvent::Error(_) => "error",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboundEvent::Content(_))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum EventPayload<'a> {
    Content { content: &'a str },
    Complete { done: bool },
    Error { error: &'a str },
}

impl<'a> From<&'a OutboundEvent> for EventPayload<'a> {
    fn from(event: &'a OutboundEvent) -> Self {
        match event {
            OutboundEvent::Content(content) => EventPayload::Content { content },
            OutboundEvent::Complete => EventPayload::Complete { done: true },
            OutboundEvent::Error(error) => EventPayload::Error { error },
        }
    }
}

/// Encode one event as `event: <name>\ndata: <json>\n\n`.
///
/// The JSON is always single-line, so newlines inside content never split
/// the `data:` field.
#[must_use]
pub fn encode_event(event: &OutboundEvent) -> Bytes {
    let payload = serde_json::to_string(&EventPayload::from(event)).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to serialize outbound event");
        "{}".to_string()
    });
    let name = event.name();
    let mut out = String::with_capacity(name.len() + payload.len() + 16);
    out.push_str("event: ");
    out.push_str(name);
    out.push_str("\ndata: ");
    out.push_str(&payload);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// Wrap an event body in a `200 text/event-stream` response.
#[must_use]
pub fn sse_response(body: axum::body::Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

/// Encodes events for one stream and refuses anything after a terminal one.
#[derive(Debug, Default)]
pub struct EventEmitter {
    terminated: bool,
}

impl EventEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `event`, or `None` once `complete` or `error` has been emitted.
    pub fn emit(&mut self, event: &OutboundEvent) -> Option<Bytes> {
        if self.terminated {
            tracing::debug!(event = event.name(), "event after terminal event dropped");
            return None;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        Some(encode_event(event))
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}
