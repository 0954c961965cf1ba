use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::session::{MemorySessionStore, SessionStore};
use crate::transport::UpstreamClient;

/// Persona sent as the system turn of every streamed exchange.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("persona.txt");

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamClient,
    pub sessions: Arc<dyn SessionStore>,
}

impl AppState {
    /// Build state with an in-memory session store sized from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when the upstream client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, RelayError> {
        let sessions = Arc::new(MemorySessionStore::new(
            Duration::from_secs(config.session.ttl_secs),
            config.session.max_sessions,
        ));
        Self::with_session_store(config, sessions)
    }

    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when the upstream client cannot be built.
    pub fn with_session_store(
        config: AppConfig,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self, RelayError> {
        let upstream = UpstreamClient::new(&config)?;
        Ok(Self {
            config,
            upstream,
            sessions,
        })
    }

    #[must_use]
    pub fn system_prompt(&self) -> &str {
        self.config
            .features
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    #[must_use]
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.stream_idle_timeout_secs)
    }
}
