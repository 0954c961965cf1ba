use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;

use crate::error::error_response;
use crate::protocol::MessageRequest;
use crate::relay::relay_stream;
use crate::state::AppState;

/// `POST /message/stream`: relay one reply as server-sent events.
pub async fn message_stream_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match MessageRequest::from_body(&body) {
        Some(request) => relay_stream(state, request),
        None => error_response(
            http::StatusCode::BAD_REQUEST,
            "message and sessionToken are required",
        ),
    }
}
