use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::error::error_response;
use crate::protocol::{MessageRequest, Turn};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    reply: Turn,
    session_token: String,
    full_history: Vec<Turn>,
}

/// `POST /chat`: one non-streamed exchange with history replay.
///
/// The user turn and the reply are appended together, and only when the
/// provider answered; concurrent calls on one token run one at a time.
pub async fn chat_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(request) = MessageRequest::from_body(&body) else {
        return error_response(
            http::StatusCode::BAD_REQUEST,
            "sessionToken and message are required",
        );
    };
    let token = request.session_token;

    let lane = state.sessions.session_lane(&token);
    let _guard = lane.lock().await;

    let user_turn = Turn::user(request.message);
    let mut messages = state.sessions.history(&token);
    messages.push(user_turn.clone());

    let reply = match state.upstream.complete(&messages).await {
        Ok(completion) => completion.first_turn(),
        Err(err) => {
            tracing::error!(session = %token, error = %err, "chat completion failed");
            return failed_to_connect();
        }
    };
    let Some(reply) = reply else {
        tracing::error!(session = %token, "chat completion returned no message");
        return failed_to_connect();
    };

    state
        .sessions
        .append_turns(&token, &[user_turn, reply.clone()]);
    let full_history = state.sessions.history(&token);
    tracing::debug!(session = %token, turns = full_history.len(), "chat reply stored");

    Json(ChatResponse {
        reply,
        session_token: token,
        full_history,
    })
    .into_response()
}

fn failed_to_connect() -> Response {
    error_response(
        http::StatusCode::INTERNAL_SERVER_ERROR,
        "failed to connect to ai",
    )
}
