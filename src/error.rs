use axum::response::{IntoResponse, Response};

/// Error type shared by the relay, the upstream client and the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Upstream connect error: {0}")]
    UpstreamConnect(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Upstream stream error: {0}")]
    UpstreamMidStream(String),
    #[error("Upstream stream idle for more than {0}s")]
    IdleTimeout(u64),
    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Upstream,
    ServerError,
}

impl RelayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::BadRequest(_) => ErrorCategory::InvalidRequest,
            RelayError::UpstreamConnect(_)
            | RelayError::Upstream { .. }
            | RelayError::UpstreamMidStream(_)
            | RelayError::IdleTimeout(_)
            | RelayError::InvalidResponse(_) => ErrorCategory::Upstream,
            RelayError::Config(_) | RelayError::Internal(_) => ErrorCategory::ServerError,
        }
    }
}

// Upstream failures surface as 500 to clients: the provider's own status is
// logged, not forwarded.
fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Upstream | ErrorCategory::ServerError => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Build the `{"error": message}` JSON response used by every endpoint.
#[must_use]
pub fn error_response(status: http::StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = http_status_for_category(self.category());
        error_response(status, &self.to_string())
    }
}
