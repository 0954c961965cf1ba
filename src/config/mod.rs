pub mod validation;

use std::path::Path;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Environment variable holding an explicit config file path.
pub const CONFIG_PATH_ENV: &str = "CHAT_RELAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid environment variable {name}: {message}")]
    Env { name: &'static str, message: String },
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Whole-request timeout for non-streaming upstream calls, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Longest gap between upstream chunks before a stream is abandoned.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default)]
    pub http_use_env_proxy: bool,
    /// Origins allowed by CORS. Empty means any origin.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

fn default_port() -> u16 {
    3000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_stream_idle_timeout_secs() -> u64 {
    60
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            http_use_env_proxy: false,
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// Completion provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            proxy: None,
        }
    }
}

/// Session retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle lifetime of a session in seconds; 0 keeps sessions forever.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Upper bound on live sessions; 0 means unbounded.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_session_ttl_secs() -> u64 {
    3600
}
fn default_max_sessions() -> usize {
    10_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Replaces the built-in persona used by the streaming endpoint.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            system_prompt: None,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration for the running process.
///
/// Reads the YAML file named by `CHAT_RELAY_CONFIG` (or `config.yaml` when it
/// exists), applies environment overrides, then validates.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the file cannot be read or parsed, an
/// environment override is malformed, or validation fails.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let explicit_path = std::env::var(CONFIG_PATH_ENV).ok();
    let path = explicit_path.as_deref().or_else(|| {
        Path::new(DEFAULT_CONFIG_PATH)
            .exists()
            .then_some(DEFAULT_CONFIG_PATH)
    });
    load_config_with(path, |name| std::env::var(name).ok())
}

/// Load configuration from an optional YAML file and an environment lookup.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, [`ConfigError::Env`] when an override is malformed, or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config_with<F>(path: Option<&str>, env: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&contents)?
        }
        None => AppConfig::default(),
    };
    apply_env_overrides(&mut config, env)?;
    validate_config(&config)?;
    Ok(config)
}

/// Apply process-environment overrides on top of file/default values.
///
/// # Errors
///
/// Returns [`ConfigError::Env`] when `PORT` is not a valid port number.
pub fn apply_env_overrides<F>(config: &mut AppConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(api_key) = env("OPENAI_API_KEY") {
        config.upstream.api_key = api_key;
    }
    if let Some(port) = env("PORT") {
        config.server.port = port.trim().parse().map_err(|err| ConfigError::Env {
            name: "PORT",
            message: format!("{err}"),
        })?;
    }
    if let Some(base_url) = env("OPENAI_BASE_URL") {
        config.upstream.base_url = base_url;
    }
    if let Some(model) = env("OPENAI_MODEL") {
        config.upstream.model = model;
    }
    if let Some(level) = env("LOG_LEVEL") {
        config.features.log_level = level;
    }
    Ok(())
}
