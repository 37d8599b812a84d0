//! Sync configuration supplied by the embedding application.

use std::time::Duration;

use thiserror::Error;

use crate::transition::ReconnectPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("WebSocket URL must start with ws:// or wss://, got {0:?}")]
    InvalidWsUrl(String),

    #[error("Updates endpoint must start with http:// or https://, got {0:?}")]
    InvalidUpdatesUrl(String),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("Backoff base ({base:?}) exceeds backoff ceiling ({max:?})")]
    BackoffInverted { base: Duration, max: Duration },

    #[error("max_reconnect_attempts must be at least 1")]
    NoReconnectAttempts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base duplex URL; the bearer token is appended as `?token=`.
    pub ws_url: String,
    /// Polling endpoint returning `{updates: [...]}`.
    pub updates_url: String,
    pub heartbeat_interval: Duration,
    /// Upper bound on TCP connect plus the upgrade handshake.
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:3001/ws".to_string(),
            updates_url: "http://localhost:3001/api/updates".to_string(),
            heartbeat_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    pub fn new(ws_url: impl Into<String>, updates_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            updates_url: updates_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidWsUrl(self.ws_url.clone()));
        }
        if !(self.updates_url.starts_with("http://") || self.updates_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidUpdatesUrl(self.updates_url.clone()));
        }
        for (name, interval) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("connect_timeout", self.connect_timeout),
            ("backoff_base", self.backoff_base),
            ("poll_interval", self.poll_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::BackoffInverted {
                base: self.backoff_base,
                max: self.backoff_max,
            });
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::NoReconnectAttempts);
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}
