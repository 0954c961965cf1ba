use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;

use super::HttpTransport;
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::protocol::{ChatCompletion, ChatCompletionRequest, Turn};

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Client for the provider's chat-completions endpoint.
///
/// The URL, auth headers and model are resolved once at startup.
pub struct UpstreamClient {
    transport: HttpTransport,
    chat_url: url::Url,
    headers: http::HeaderMap,
    model: String,
    timeout: Duration,
}

impl UpstreamClient {
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when the base URL, API key or proxy
    /// cannot be turned into a request target.
    pub fn new(config: &AppConfig) -> Result<Self, RelayError> {
        let upstream = &config.upstream;
        let base = upstream.base_url.trim_end_matches('/');
        let chat_url = url::Url::parse(&format!("{base}/chat/completions"))
            .map_err(|err| RelayError::Config(format!("Invalid upstream base_url: {err}")))?;

        let mut headers = http::HeaderMap::with_capacity(2);
        let mut auth = http::HeaderValue::from_str(&format!("Bearer {}", upstream.api_key))
            .map_err(|_| RelayError::Config("API key is not a valid header value".into()))?;
        auth.set_sensitive(true);
        headers.insert(http::header::AUTHORIZATION, auth);
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );

        Ok(Self {
            transport: HttpTransport::new(&config.server, upstream.proxy.as_deref())?,
            chat_url,
            headers,
            model: upstream.model.clone(),
            timeout: Duration::from_secs(config.server.timeout),
        })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run a non-streaming completion over `messages`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UpstreamConnect`] when the provider is
    /// unreachable, [`RelayError::Upstream`] on a non-2xx answer, and
    /// [`RelayError::InvalidResponse`] when the body is not a completion.
    pub async fn complete(&self, messages: &[Turn]) -> Result<ChatCompletion, RelayError> {
        let body = encode_request(&ChatCompletionRequest::new(&self.model, messages))?;
        let response = self
            .transport
            .post(&self.chat_url, &self.headers, body, Some(self.timeout))
            .await?;
        let response = ensure_success(response).await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|err| RelayError::UpstreamConnect(err.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| RelayError::InvalidResponse(format!("undecodable completion: {err}")))
    }

    /// Open a streaming completion and hand back its raw body.
    ///
    /// Returns once the response head has arrived with a 2xx status.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UpstreamConnect`] when the provider is
    /// unreachable and [`RelayError::Upstream`] on a non-2xx answer.
    pub async fn complete_streaming(
        &self,
        messages: &[Turn],
    ) -> Result<impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static, RelayError>
    {
        let body = encode_request(&ChatCompletionRequest::streaming(&self.model, messages))?;
        let response = self
            .transport
            .post(&self.chat_url, &self.headers, body, None)
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.bytes_stream())
    }
}

fn encode_request(request: &ChatCompletionRequest<'_>) -> Result<Bytes, RelayError> {
    serde_json::to_vec(request)
        .map(Bytes::from)
        .map_err(|err| RelayError::Internal(format!("failed to encode request: {err}")))
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let message = sanitize_upstream_error(&body);
    tracing::warn!(status = status.as_u16(), error = %message, "upstream returned error status");
    Err(RelayError::Upstream {
        status: status.as_u16(),
        message,
    })
}

/// Reduce a provider error body to a short message.
///
/// Prefers `error.message` from a JSON body, otherwise the raw text; either
/// is cut to a bounded length on a character boundary.
pub(crate) fn sanitize_upstream_error(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(message) = json
            .get("error")
            .and_then(|err| err.get("message"))
            .and_then(serde_json::Value::as_str)
        {
            return truncate_message(message);
        }
    }
    truncate_message(&String::from_utf8_lossy(body))
}

fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}
