use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::error::{error_response, RelayError};
use crate::protocol::Turn;
use crate::state::AppState;

/// Minimal prompt used to check that the provider answers.
const PROBE_PROMPT: &str = "he";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    session_token: String,
    conversation_id: String,
    message: &'static str,
}

/// `POST /start`: probe the provider, then open a session.
///
/// No session is created when the probe fails.
pub async fn start_handler(State(state): State<Arc<AppState>>) -> Response {
    let probe = [Turn::system(PROBE_PROMPT)];
    let completion = match state.upstream.complete(&probe).await {
        Ok(completion) => completion,
        Err(RelayError::InvalidResponse(detail)) => {
            tracing::warn!(error = %detail, "provider probe returned an unusable body");
            return error_response(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                "invalid api response",
            );
        }
        Err(err) => {
            tracing::error!(error = %err, "provider probe failed");
            return error_response(http::StatusCode::INTERNAL_SERVER_ERROR, "api error");
        }
    };
    if completion.choices.is_empty() {
        tracing::warn!("provider probe returned no choices");
        return error_response(
            http::StatusCode::INTERNAL_SERVER_ERROR,
            "invalid api response",
        );
    }

    let session_token = state.sessions.create_session();
    let conversation_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(session = %session_token, conversation = %conversation_id, "api connected");

    Json(StartResponse {
        session_token,
        conversation_id,
        message: "api connected",
    })
    .into_response()
}
