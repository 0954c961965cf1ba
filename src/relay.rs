//! Streaming relay from the provider to one browser.
//!
//! The response head goes out immediately; the upstream connection is opened
//! on the first poll of the body. Each poll drives the state machine
//! `Connect -> Relay -> Finished` far enough to produce one encoded event.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::RelayError;
use crate::protocol::{MessageRequest, Turn};
use crate::state::AppState;
use crate::stream::{sse_response, EventEmitter, OutboundEvent, ProviderStream, StreamItem};

/// Message of the `error` event sent when the upstream cannot be reached.
pub const CONNECT_FAILURE_MESSAGE: &str = "Failed to connect to upstream";

type ItemStream = Pin<Box<dyn Stream<Item = Result<StreamItem, RelayError>> + Send>>;

enum Phase {
    Connect,
    Relay(ItemStream),
    Finished,
}

struct RelayState {
    app: Arc<AppState>,
    session_token: String,
    messages: Vec<Turn>,
    phase: Phase,
    emitter: EventEmitter,
    fragments: usize,
}

impl RelayState {
    fn new(app: Arc<AppState>, request: MessageRequest) -> Self {
        let messages = vec![
            Turn::system(app.system_prompt()),
            Turn::user(request.message),
        ];
        Self {
            app,
            session_token: request.session_token,
            messages,
            phase: Phase::Connect,
            emitter: EventEmitter::new(),
            fragments: 0,
        }
    }

    /// Produce the next encoded event, or `None` once a terminal event is out.
    async fn next_event(&mut self) -> Option<Bytes> {
        loop {
            let event = match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,
                Phase::Connect => {
                    match connect(&self.app, &self.messages, &self.session_token).await {
                        Ok(items) => {
                            self.phase = Phase::Relay(items);
                            continue;
                        }
                        Err(err) => {
                            tracing::warn!(session = %self.session_token, error = %err, "stream connect failed");
                            OutboundEvent::Error(CONNECT_FAILURE_MESSAGE.to_string())
                        }
                    }
                }
                Phase::Relay(mut items) => match items.next().await {
                    Some(Ok(StreamItem::Fragment(text))) => {
                        self.fragments += 1;
                        self.phase = Phase::Relay(items);
                        OutboundEvent::Content(text)
                    }
                    Some(Ok(StreamItem::Done)) | None => {
                        tracing::debug!(
                            session = %self.session_token,
                            fragments = self.fragments,
                            "stream complete"
                        );
                        OutboundEvent::Complete
                    }
                    Some(Err(err)) => {
                        tracing::warn!(
                            session = %self.session_token,
                            fragments = self.fragments,
                            error = %err,
                            "stream aborted"
                        );
                        OutboundEvent::Error(err.to_string())
                    }
                },
            };
            return self.emitter.emit(&event);
        }
    }
}

async fn connect(
    app: &AppState,
    messages: &[Turn],
    session_token: &str,
) -> Result<ItemStream, RelayError> {
    let idle_timeout = app.stream_idle_timeout();
    let bytes = tokio::time::timeout(idle_timeout, app.upstream.complete_streaming(messages))
        .await
        .map_err(|_| RelayError::UpstreamConnect("timed out waiting for response head".into()))??;
    tracing::debug!(session = %session_token, "upstream stream opened");
    Ok(Box::pin(
        ProviderStream::new(bytes)
            .with_idle_timeout(idle_timeout)
            .into_stream(),
    ))
}

impl Drop for RelayState {
    fn drop(&mut self) {
        if !self.emitter.is_terminated() {
            tracing::debug!(
                session = %self.session_token,
                fragments = self.fragments,
                "client disconnected before stream finished"
            );
        }
    }
}

/// Start a streamed exchange for a validated request.
///
/// The returned response carries the event stream headers; the upstream call
/// happens lazily as the body is polled, and dropping the body drops the
/// upstream connection with it.
pub fn relay_stream(app: Arc<AppState>, request: MessageRequest) -> Response {
    tracing::info!(session = %request.session_token, "stream started");
    let state = RelayState::new(app, request);
    let events = futures_util::stream::unfold(state, |mut state| async move {
        let bytes = state.next_event().await?;
        Some((bytes, state))
    });
    sse_response(axum::body::Body::from_stream(
        events.map(Ok::<Bytes, Infallible>),
    ))
}
