//! HTTP polling fallback.
//!
//! Used once the duplex channel is given up on. Each cycle fetches a batch of
//! updates and hands them to the same dispatcher the socket path feeds.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use sitesync_protocol::{ServerMessage, UpdatesBatch};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::bearer;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Poll request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Poll endpoint returned {0}")]
    Status(StatusCode),

    #[error("Poll response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Where polling cycles get their updates from.
pub trait UpdateSource: Send + Sync + 'static {
    /// Fetch one batch. Failures are absorbed and come back as an empty batch.
    fn fetch_updates(&self, token: Option<String>) -> BoxFuture<'static, Vec<ServerMessage>>;
}

#[derive(Debug, Clone)]
pub struct PollingClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl PollingClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One polling request. Items that do not parse are skipped individually.
    pub async fn fetch(&self, token: Option<&str>) -> Result<Vec<ServerMessage>, PollError> {
        let mut request = self.client.get(&self.endpoint).timeout(self.timeout);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, bearer(token));
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PollError::Status(status));
        }

        let body = resp.text().await?;
        let batch: UpdatesBatch = serde_json::from_str(&body)?;
        Ok(decode_updates(batch))
    }
}

impl UpdateSource for PollingClient {
    fn fetch_updates(&self, token: Option<String>) -> BoxFuture<'static, Vec<ServerMessage>> {
        let this = self.clone();
        Box::pin(async move {
            match this.fetch(token.as_deref()).await {
                Ok(updates) => updates,
                Err(e) => {
                    debug!(
                        component = "polling",
                        event = "poll.no_updates",
                        endpoint = %this.endpoint,
                        error = %e,
                        "Poll cycle produced no updates"
                    );
                    Vec::new()
                }
            }
        })
    }
}

fn decode_updates(batch: UpdatesBatch) -> Vec<ServerMessage> {
    batch
        .updates
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<ServerMessage>(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(
                    component = "polling",
                    event = "poll.update.malformed",
                    error = %e,
                    "Skipping malformed update"
                );
                None
            }
        })
        .collect()
}
