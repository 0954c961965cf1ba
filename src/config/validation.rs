use super::{AppConfig, ConfigError};

const VALID_LOG_LEVELS: &[&str] = &[
    "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL", "DISABLED",
];
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream_config(config)?;
    validate_features(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if server.stream_idle_timeout_secs == 0 {
        return Err(validation_err(
            "server.stream_idle_timeout_secs must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    for origin in &server.cors_allowed_origins {
        if http::HeaderValue::from_str(origin).is_err() {
            return Err(validation_err(format!(
                "server.cors_allowed_origins contains an invalid origin: '{origin}'"
            )));
        }
    }
    Ok(())
}

fn validate_upstream_config(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    if upstream.api_key.trim().is_empty() {
        return Err(validation_err(
            "upstream.api_key is empty (set OPENAI_API_KEY)",
        ));
    }
    if upstream.model.trim().is_empty() {
        return Err(validation_err("upstream.model cannot be empty"));
    }
    match url::Url::parse(&upstream.base_url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(parsed) => {
            return Err(validation_err(format!(
                "upstream.base_url has unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        Err(err) => {
            return Err(validation_err(format!(
                "upstream.base_url is not a valid URL: {err}"
            )));
        }
    }
    if let Some(proxy) = upstream.proxy.as_deref() {
        if url::Url::parse(proxy).is_err() {
            return Err(validation_err(format!(
                "upstream.proxy is not a valid URL: '{proxy}'"
            )));
        }
    }
    Ok(())
}

fn validate_features(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "features.log_level '{}' is not one of {VALID_LOG_LEVELS:?}",
            config.features.log_level
        )));
    }
    let format = config.features.log_format.to_lowercase();
    if !VALID_LOG_FORMATS.contains(&format.as_str()) {
        return Err(validation_err(format!(
            "features.log_format '{}' is not one of {VALID_LOG_FORMATS:?}",
            config.features.log_format
        )));
    }
    if let Some(prompt) = config.features.system_prompt.as_deref() {
        if prompt.trim().is_empty() {
            return Err(validation_err(
                "features.system_prompt cannot be blank when set",
            ));
        }
    }
    Ok(())
}
