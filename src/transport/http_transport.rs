use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::RelayError;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    use_env_proxy: bool,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, RelayError> {
    // No client-wide timeout: streamed bodies may legitimately run for minutes.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| RelayError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Config(format!("Failed to build HTTP client: {err}")))
}

/// Pooled HTTP client for upstream calls.
///
/// Every request is a single attempt; failures are reported to the caller
/// rather than retried.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport from server settings and an optional upstream proxy.
    ///
    /// A client that fails to build with the configured options falls back to
    /// reqwest's defaults; only an unparseable proxy URL is an error.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when `proxy_url` is not a valid proxy.
    pub fn new(config: &ServerConfig, proxy_url: Option<&str>) -> Result<Self, RelayError> {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        let pool_max_idle_per_host = config.http_pool_max_idle_per_host.max(1);

        let client = match build_reqwest_client(
            pool_max_idle_per_host,
            pool_idle_timeout,
            config.http_use_env_proxy,
            proxy_url,
        ) {
            Ok(client) => client,
            Err(err) if proxy_url.is_some() => return Err(err),
            Err(err) => {
                tracing::error!(error = %err, "failed to build configured reqwest client, falling back to default client");
                reqwest::Client::new()
            }
        };
        Ok(Self { client })
    }

    /// POST `body` to `url`.
    ///
    /// `timeout` bounds the whole exchange including the body read; pass
    /// `None` for streamed responses.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UpstreamConnect`] when the request cannot be
    /// sent or no response head arrives.
    pub async fn post(
        &self,
        url: &url::Url,
        headers: &http::HeaderMap,
        body: bytes::Bytes,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, RelayError> {
        let mut request = reqwest::Request::new(http::Method::POST, url.clone());
        *request.headers_mut() = headers.clone();
        *request.body_mut() = Some(reqwest::Body::from(body));
        *request.timeout_mut() = timeout;

        self.client
            .execute(request)
            .await
            .map_err(|err| RelayError::UpstreamConnect(err.to_string()))
    }
}
