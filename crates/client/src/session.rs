//! Session-scoped sync service.
//!
//! One `SyncSession` per signed-in session, passed to whoever needs the
//! collections or the connection status. Every operation is fire-and-forget;
//! failures are absorbed by the supervisor and show up only as status.

use std::sync::Arc;

use sitesync_protocol::PresenceStatus;
use sitesync_transport::{Transport, WsTransport};
use tokio::sync::broadcast;
use tracing::info;

use crate::auth::TokenSource;
use crate::collections::CollectionStore;
use crate::config::{ConfigError, SyncConfig};
use crate::dispatcher::{EventDispatcher, LogSink, NotificationSink, PresenceSink};
use crate::polling::{PollingClient, UpdateSource};
use crate::reconcile::{Applied, EntityEvent};
use crate::supervisor::{
    ConnectionSnapshot, SupervisorCommand, SupervisorHandle, SupervisorParts,
};

/// Everything a session is wired to.
pub struct SessionParts<T> {
    pub transport: T,
    pub tokens: Arc<dyn TokenSource>,
    pub updates: Arc<dyn UpdateSource>,
    pub notices: Arc<dyn NotificationSink>,
    pub presence: Arc<dyn PresenceSink>,
    pub store: Arc<CollectionStore>,
}

impl SessionParts<WsTransport> {
    /// WebSocket transport, HTTP polling, log-only sinks and the default
    /// entity registry.
    pub fn websocket(config: &SyncConfig, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            transport: WsTransport::new().with_connect_timeout(config.connect_timeout),
            tokens,
            updates: Arc::new(
                PollingClient::new(config.updates_url.clone()).with_timeout(config.poll_interval),
            ),
            notices: Arc::new(LogSink),
            presence: Arc::new(LogSink),
            store: Arc::new(CollectionStore::default()),
        }
    }
}

/// Handle to one sync session (cheap to Clone).
#[derive(Clone)]
pub struct SyncSession {
    supervisor: SupervisorHandle,
    store: Arc<CollectionStore>,
}

impl SyncSession {
    /// Validate the config and spawn the supervisor. Must be called inside a
    /// tokio runtime. The session stays Idle until [`SyncSession::start`].
    pub fn new<T: Transport>(config: &SyncConfig, parts: SessionParts<T>) -> Result<Self, ConfigError> {
        config.validate()?;

        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&parts.store),
            parts.notices,
            parts.presence,
        ));
        let supervisor = SupervisorHandle::spawn(
            config,
            SupervisorParts {
                transport: parts.transport,
                tokens: parts.tokens,
                updates: parts.updates,
                dispatcher,
            },
        );

        info!(
            component = "session",
            event = "session.created",
            ws_url = %config.ws_url,
            updates_url = %config.updates_url,
            entity_types = parts.store.entity_types().len(),
        );

        Ok(Self {
            supervisor,
            store: parts.store,
        })
    }

    pub fn websocket(config: &SyncConfig, tokens: Arc<dyn TokenSource>) -> Result<Self, ConfigError> {
        Self::new(config, SessionParts::websocket(config, tokens))
    }

    pub async fn start(&self) {
        self.supervisor.send(SupervisorCommand::Start).await;
    }

    /// Close the channel, cancel timers and polling, clear the collections.
    /// Returns once all of that has happened.
    pub async fn teardown(&self) {
        self.supervisor.teardown().await;
    }

    pub async fn join_scope(&self, id: impl Into<String>) {
        self.supervisor
            .send(SupervisorCommand::JoinScope { id: id.into() })
            .await;
    }

    pub async fn leave_scope(&self) {
        self.supervisor.send(SupervisorCommand::LeaveScope).await;
    }

    /// Login or impersonation changed who we are: reconnect from scratch
    /// with whatever token the token source now hands out.
    pub async fn switch_identity(&self) {
        self.supervisor.send(SupervisorCommand::SwitchIdentity).await;
    }

    pub async fn send_chat(&self, message: impl Into<String>) {
        self.supervisor
            .send(SupervisorCommand::SendChat {
                message: message.into(),
            })
            .await;
    }

    pub async fn ping_presence(&self, status: PresenceStatus) {
        self.supervisor
            .send(SupervisorCommand::PingPresence { status })
            .await;
    }

    pub fn status(&self) -> Arc<ConnectionSnapshot> {
        self.supervisor.snapshot()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionSnapshot> {
        self.supervisor.subscribe_status()
    }

    pub fn collections(&self) -> &Arc<CollectionStore> {
        &self.store
    }

    /// Local write ahead of the server; the later echo lands on the same slot.
    pub fn apply_optimistic(&self, entity_type: &str, event: EntityEvent) -> Option<Applied> {
        self.store.apply_optimistic(entity_type, event)
    }
}
