//! Connection supervisor actor.
//!
//! Owns the transport, the timers and the connection state, and processes
//! channel events, timer ticks, poll results and caller commands one at a
//! time. Callers talk to it through `SupervisorHandle`, which sends
//! `SupervisorCommand` messages over an mpsc channel. Status reads go through
//! `ArcSwap` and never touch the actor.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use sitesync_protocol::{ClientMessage, PresenceStatus, ServerMessage};
use sitesync_transport::{ChannelEvent, Transport};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::auth::{with_token_query, TokenSource};
use crate::config::SyncConfig;
use crate::dispatcher::EventDispatcher;
use crate::polling::UpdateSource;
use crate::transition::{transition, ConnectionState, Effect, Input, Phase, ReconnectPolicy};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Point-in-time view of the connection, readable without the actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub phase: Phase,
    pub attempt: u32,
    pub scope: Option<String>,
    pub last_heartbeat_ack: Option<std::time::Instant>,
    /// True once the session has fallen back to polling.
    pub degraded: bool,
}

impl ConnectionSnapshot {
    fn of(state: &ConnectionState) -> Self {
        Self {
            phase: state.phase,
            attempt: state.attempt,
            scope: state.scope.current().map(str::to_string),
            last_heartbeat_ack: state.last_heartbeat_ack,
            degraded: state.phase == Phase::Polling,
        }
    }

    /// Same status, ignoring heartbeat bookkeeping.
    fn same_status(&self, other: &Self) -> bool {
        self.phase == other.phase && self.attempt == other.attempt && self.scope == other.scope
    }
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self::of(&ConnectionState::default())
    }
}

/// Commands accepted by the supervisor actor.
pub enum SupervisorCommand {
    Start,
    JoinScope { id: String },
    LeaveScope,
    SwitchIdentity,
    SendChat { message: String },
    PingPresence { status: PresenceStatus },
    /// Replies once everything is cancelled and the channel is closed.
    Teardown { reply: oneshot::Sender<()> },
}

/// Collaborators the supervisor drives.
pub struct SupervisorParts<T> {
    pub transport: T,
    pub tokens: Arc<dyn TokenSource>,
    pub updates: Arc<dyn UpdateSource>,
    pub dispatcher: Arc<EventDispatcher>,
}

/// Handle to a running supervisor (cheap to Clone).
#[derive(Clone)]
pub struct SupervisorHandle {
    command_tx: mpsc::Sender<SupervisorCommand>,
    snapshot: Arc<ArcSwap<ConnectionSnapshot>>,
    status_tx: broadcast::Sender<ConnectionSnapshot>,
}

impl SupervisorHandle {
    /// Spawn the actor. It sits in Idle until `Start`.
    pub fn spawn<T: Transport>(config: &SyncConfig, parts: SupervisorParts<T>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (channel_tx, channel_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (poll_tx, poll_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(ConnectionSnapshot::default()));

        let supervisor = Supervisor {
            state: ConnectionState::default(),
            policy: config.reconnect_policy(),
            ws_url: config.ws_url.clone(),
            heartbeat_every: config.heartbeat_interval,
            poll_every: config.poll_interval,
            transport: parts.transport,
            tokens: parts.tokens,
            updates: parts.updates,
            dispatcher: parts.dispatcher,
            channel_tx,
            poll_tx,
            heartbeat: None,
            reconnect: None,
            poll: None,
            snapshot: Arc::clone(&snapshot),
            status_tx: status_tx.clone(),
        };
        tokio::spawn(supervisor.run(command_rx, channel_rx, poll_rx));

        Self {
            command_tx,
            snapshot,
            status_tx,
        }
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: SupervisorCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "supervisor",
                event = "supervisor.command.dropped",
                "Supervisor channel closed, command dropped"
            );
        }
    }

    /// Try to send a command without awaiting (for non-async contexts).
    pub fn try_send(&self, cmd: SupervisorCommand) {
        if self.command_tx.try_send(cmd).is_err() {
            warn!(
                component = "supervisor",
                event = "supervisor.command.dropped",
                "Supervisor channel full or closed"
            );
        }
    }

    /// Tear down and wait until the actor has closed everything.
    pub async fn teardown(&self) {
        let (reply, done) = oneshot::channel();
        self.send(SupervisorCommand::Teardown { reply }).await;
        let _ = done.await;
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.snapshot.load_full()
    }

    /// Stream of status changes (phase, attempt or scope).
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionSnapshot> {
        self.status_tx.subscribe()
    }
}

type ReconnectTimer = Option<(u64, Pin<Box<Sleep>>)>;

struct Supervisor<T> {
    state: ConnectionState,
    policy: ReconnectPolicy,
    ws_url: String,
    heartbeat_every: Duration,
    poll_every: Duration,

    transport: T,
    tokens: Arc<dyn TokenSource>,
    updates: Arc<dyn UpdateSource>,
    dispatcher: Arc<EventDispatcher>,

    channel_tx: mpsc::Sender<ChannelEvent>,
    poll_tx: mpsc::Sender<(u64, Vec<ServerMessage>)>,

    heartbeat: Option<Interval>,
    reconnect: ReconnectTimer,
    poll: Option<Interval>,

    snapshot: Arc<ArcSwap<ConnectionSnapshot>>,
    status_tx: broadcast::Sender<ConnectionSnapshot>,
}

/// What one loop iteration decided to do.
enum Step {
    Apply(Input),
    Teardown(oneshot::Sender<()>),
    Exit,
}

impl<T: Transport> Supervisor<T> {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SupervisorCommand>,
        mut channel_rx: mpsc::Receiver<ChannelEvent>,
        mut poll_rx: mpsc::Receiver<(u64, Vec<ServerMessage>)>,
    ) {
        loop {
            let step = tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(SupervisorCommand::Teardown { reply }) => Step::Teardown(reply),
                    Some(cmd) => Step::Apply(command_input(cmd)),
                    None => Step::Exit,
                },
                Some(event) = channel_rx.recv() => Step::Apply(Input::from(event)),
                _ = tick(&mut self.heartbeat) => Step::Apply(Input::HeartbeatDue),
                timer = reconnect_due(&mut self.reconnect) => {
                    Step::Apply(Input::ReconnectDue { timer })
                }
                _ = tick(&mut self.poll) => Step::Apply(Input::PollDue),
                Some((generation, updates)) = poll_rx.recv() => {
                    Step::Apply(Input::PollCompleted { generation, updates })
                }
            };

            match step {
                Step::Apply(input) => {
                    if matches!(input, Input::ReconnectDue { .. }) {
                        // A fired Sleep stays ready; drop it before it spins the loop.
                        self.reconnect = None;
                    }
                    self.apply(input);
                }
                Step::Teardown(reply) => {
                    self.apply(Input::Teardown);
                    let _ = reply.send(());
                }
                Step::Exit => {
                    self.apply(Input::Teardown);
                    debug!(
                        component = "supervisor",
                        event = "supervisor.exit",
                        "All handles dropped, supervisor exiting"
                    );
                    return;
                }
            }
        }
    }

    fn apply(&mut self, input: Input) {
        let before = self.state.phase;
        let now = Instant::now().into_std();
        let (state, effects) =
            transition(std::mem::take(&mut self.state), input, &self.policy, now);
        self.state = state;

        if before != self.state.phase {
            info!(
                component = "supervisor",
                event = "supervisor.phase_changed",
                from = before.as_str(),
                to = self.state.phase.as_str(),
                attempt = self.state.attempt,
            );
        }

        for effect in effects {
            self.execute(effect);
        }
        self.publish();
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenChannel { connection } => {
                let token = self.tokens.bearer_token();
                let url = with_token_query(&self.ws_url, token.as_deref());
                info!(
                    component = "supervisor",
                    event = "supervisor.connect",
                    connection_id = connection,
                    attempt = self.state.attempt,
                    has_token = token.is_some(),
                );
                self.transport.open(&url, connection, self.channel_tx.clone());
            }
            Effect::CloseChannel => self.transport.close(),
            Effect::Authenticate => match self.tokens.bearer_token() {
                Some(token) => self
                    .transport
                    .send(&ClientMessage::JoinUserChannel { token }),
                None => warn!(
                    component = "supervisor",
                    event = "supervisor.identify.no_token",
                    "No bearer token available, channel stays unidentified"
                ),
            },
            Effect::Send(message) => self.transport.send(&message),

            Effect::StartHeartbeat => {
                let mut interval = tokio::time::interval_at(
                    Instant::now() + self.heartbeat_every,
                    self.heartbeat_every,
                );
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
            }
            Effect::StopHeartbeat => self.heartbeat = None,

            Effect::ScheduleReconnect { timer, delay } => {
                debug!(
                    component = "supervisor",
                    event = "supervisor.reconnect.scheduled",
                    attempt = self.state.attempt,
                    delay_ms = delay.as_millis() as u64,
                );
                self.reconnect = Some((timer, Box::pin(tokio::time::sleep(delay))));
            }
            Effect::CancelReconnect => self.reconnect = None,

            Effect::StartPolling => {
                warn!(
                    component = "supervisor",
                    event = "supervisor.degraded",
                    attempts = self.state.attempt,
                    poll_interval_ms = self.poll_every.as_millis() as u64,
                    "Realtime channel unavailable, falling back to polling"
                );
                let mut interval = tokio::time::interval(self.poll_every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.poll = Some(interval);
            }
            Effect::StopPolling => self.poll = None,
            Effect::RequestUpdates { generation } => {
                let request = self.updates.fetch_updates(self.tokens.bearer_token());
                let poll_tx = self.poll_tx.clone();
                tokio::spawn(async move {
                    let updates = request.await;
                    let _ = poll_tx.send((generation, updates)).await;
                });
            }

            Effect::DispatchFrame(text) => {
                self.dispatcher.dispatch_frame(&text);
            }
            Effect::DispatchUpdates(updates) => {
                debug!(
                    component = "supervisor",
                    event = "supervisor.poll.batch",
                    updates = updates.len(),
                );
                for update in updates {
                    self.dispatcher.dispatch(update);
                }
            }
            Effect::ClearCollections => self.dispatcher.store().clear(),
        }
    }

    fn publish(&self) {
        let next = ConnectionSnapshot::of(&self.state);
        let previous = self.snapshot.swap(Arc::new(next.clone()));
        if !previous.same_status(&next) {
            let _ = self.status_tx.send(next);
        }
    }
}

fn command_input(cmd: SupervisorCommand) -> Input {
    match cmd {
        SupervisorCommand::Start => Input::Start,
        SupervisorCommand::JoinScope { id } => Input::JoinScope(id),
        SupervisorCommand::LeaveScope => Input::LeaveScope,
        SupervisorCommand::SwitchIdentity => Input::IdentityChanged,
        SupervisorCommand::SendChat { message } => Input::SendChat(message),
        SupervisorCommand::PingPresence { status } => Input::PingPresence(status),
        SupervisorCommand::Teardown { .. } => Input::Teardown,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn reconnect_due(slot: &mut ReconnectTimer) -> u64 {
    match slot {
        Some((timer, sleep)) => {
            sleep.as_mut().await;
            *timer
        }
        None => std::future::pending::<u64>().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use sitesync_transport::{ConnectionId, TransportError};

    use crate::auth::StaticToken;
    use crate::collections::CollectionStore;
    use crate::dispatcher::LogSink;

    #[derive(Default)]
    pub(crate) struct TransportLog {
        pub opened: Vec<(String, ConnectionId)>,
        pub sent: Vec<ClientMessage>,
        pub closes: usize,
        events: Option<mpsc::Sender<ChannelEvent>>,
    }

    /// In-memory transport. Tests play the server by emitting channel events.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub log: Arc<Mutex<TransportLog>>,
    }

    impl RecordingTransport {
        pub fn emit(&self, event: ChannelEvent) {
            let log = self.log.lock().unwrap();
            let events = log.events.as_ref().expect("transport was never opened");
            events.try_send(event).expect("event channel full");
        }

        pub fn last_connection(&self) -> ConnectionId {
            self.log.lock().unwrap().opened.last().map(|(_, c)| *c).unwrap_or(0)
        }

        pub fn open_count(&self) -> usize {
            self.log.lock().unwrap().opened.len()
        }

        pub fn sent(&self) -> Vec<ClientMessage> {
            self.log.lock().unwrap().sent.clone()
        }

        pub fn accept(&self) {
            let connection = self.last_connection();
            self.emit(ChannelEvent::Opened { connection });
        }

        pub fn refuse(&self) {
            let connection = self.last_connection();
            self.emit(ChannelEvent::Failed {
                connection,
                error: TransportError::ChannelClosed,
            });
        }

        pub fn hang_up(&self) {
            let connection = self.last_connection();
            self.emit(ChannelEvent::Closed {
                connection,
                reason: Some("server restart".into()),
            });
        }

        pub fn push_frame(&self, text: &str) {
            let connection = self.last_connection();
            self.emit(ChannelEvent::Message {
                connection,
                text: text.to_string(),
            });
        }
    }

    impl Transport for RecordingTransport {
        fn open(&mut self, url: &str, connection: ConnectionId, events: mpsc::Sender<ChannelEvent>) {
            let mut log = self.log.lock().unwrap();
            log.opened.push((url.to_string(), connection));
            log.events = Some(events);
        }

        fn send(&mut self, message: &ClientMessage) {
            self.log.lock().unwrap().sent.push(message.clone());
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closes += 1;
        }

        fn is_open(&self) -> bool {
            false
        }
    }

    /// Update source that replays a fixed batch and counts requests.
    #[derive(Default)]
    pub(crate) struct CannedUpdates {
        pub batch: Vec<ServerMessage>,
        pub requests: AtomicUsize,
        pub tokens: Mutex<Vec<Option<String>>>,
    }

    impl UpdateSource for CannedUpdates {
        fn fetch_updates(&self, token: Option<String>) -> BoxFuture<'static, Vec<ServerMessage>> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(token);
            let batch = self.batch.clone();
            Box::pin(async move { batch })
        }
    }

    pub(crate) fn test_config() -> SyncConfig {
        SyncConfig {
            ws_url: "ws://sync.test/ws".into(),
            updates_url: "http://sync.test/api/updates".into(),
            heartbeat_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 3,
            poll_interval: Duration::from_secs(10),
        }
    }

    struct Harness {
        handle: SupervisorHandle,
        transport: RecordingTransport,
        tokens: StaticToken,
        updates: Arc<CannedUpdates>,
        store: Arc<CollectionStore>,
    }

    fn harness(batch: Vec<ServerMessage>) -> Harness {
        let transport = RecordingTransport::default();
        let tokens = StaticToken::new("token-1");
        let updates = Arc::new(CannedUpdates {
            batch,
            ..CannedUpdates::default()
        });
        let store = Arc::new(CollectionStore::default());
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&store),
            Arc::new(LogSink),
            Arc::new(LogSink),
        ));
        let handle = SupervisorHandle::spawn(
            &test_config(),
            SupervisorParts {
                transport: transport.clone(),
                tokens: Arc::new(tokens.clone()),
                updates: updates.clone(),
                dispatcher,
            },
        );
        Harness {
            handle,
            transport,
            tokens,
            updates,
            store,
        }
    }

    /// Let the actor drain everything that is ready.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// Advance the paused clock, then let timers that fired be processed.
    async fn wait(duration: Duration) {
        tokio::time::sleep(duration).await;
        settle().await;
    }

    fn joins(sent: &[ClientMessage]) -> usize {
        sent.iter()
            .filter(|m| matches!(m, ClientMessage::JoinProject { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn start_opens_with_token_and_identifies() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;

        assert_eq!(h.handle.snapshot().phase, Phase::Connecting);
        let opened = h.transport.log.lock().unwrap().opened.clone();
        assert_eq!(opened, vec![("ws://sync.test/ws?token=token-1".to_string(), 1)]);

        h.transport.accept();
        settle().await;

        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.phase, Phase::Open);
        assert!(!snapshot.degraded);
        assert_eq!(
            h.transport.sent(),
            vec![ClientMessage::JoinUserChannel {
                token: "token-1".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_reconciled_into_collections() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        h.transport.accept();
        settle().await;

        h.transport.push_frame(
            r#"{"type":"entity_create","entityType":"tasks","data":{"id":"t1","title":"Pour foundation","status":"pending"}}"#,
        );
        h.transport.push_frame("garbage");
        h.transport.push_frame(
            r#"{"type":"entity_update","entityType":"tasks","data":{"id":"t1","status":"completed"}}"#,
        );
        settle().await;

        let tasks = h.store.snapshot("tasks").unwrap_or_default();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].get("status"), Some(&serde_json::json!("completed")));
        assert_eq!(tasks[0].get("title"), Some(&serde_json::json!("Pour foundation")));
        assert_eq!(h.handle.snapshot().phase, Phase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_on_interval_while_open() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        h.transport.accept();
        settle().await;

        wait(Duration::from_secs(24)).await;
        let pings = |sent: Vec<ClientMessage>| {
            sent.iter()
                .filter(|m| matches!(m, ClientMessage::PresencePing { status: None }))
                .count()
        };
        assert_eq!(pings(h.transport.sent()), 0);

        wait(Duration::from_secs(2)).await;
        assert_eq!(pings(h.transport.sent()), 1);

        wait(Duration::from_secs(25)).await;
        assert_eq!(pings(h.transport.sent()), 2);

        h.transport.hang_up();
        settle().await;
        wait(Duration::from_millis(500)).await;
        assert_eq!(pings(h.transport.sent()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_fetches_a_fresh_token_and_replays_scope_once() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        h.transport.accept();
        settle().await;

        h.handle
            .send(SupervisorCommand::JoinScope { id: "P1".into() })
            .await;
        settle().await;
        assert_eq!(joins(&h.transport.sent()), 1);

        h.tokens.set(Some("token-2".into()));
        h.transport.hang_up();
        settle().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Reconnecting);
        assert_eq!(joins(&h.transport.sent()), 1);

        wait(Duration::from_secs(1)).await;
        assert_eq!(h.transport.open_count(), 2);
        let (url, _) = h.transport.log.lock().unwrap().opened[1].clone();
        assert!(url.ends_with("token=token-2"));

        h.transport.accept();
        settle().await;
        let sent = h.transport.sent();
        assert_eq!(joins(&sent), 2);
        assert_eq!(
            sent[sent.len() - 2..].to_vec(),
            vec![
                ClientMessage::JoinUserChannel {
                    token: "token-2".into()
                },
                ClientMessage::JoinProject {
                    project_id: "P1".into()
                },
            ]
        );
        assert_eq!(h.handle.snapshot().scope.as_deref(), Some("P1"));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_polling_after_max_attempts() {
        let batch = vec![serde_json::from_str::<ServerMessage>(
            r#"{"type":"entity_create","entityType":"equipment","data":{"id":5,"name":"Loader"}}"#,
        )
        .expect("parse batch")];
        let h = harness(batch);
        let mut status = h.handle.subscribe_status();

        h.handle.send(SupervisorCommand::Start).await;
        settle().await;

        // attempt 1 and 2 fail and back off; attempt 3 reaches the ceiling
        h.transport.refuse();
        settle().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Reconnecting);
        assert_eq!(h.handle.snapshot().attempt, 1);

        wait(Duration::from_secs(2)).await;
        assert_eq!(h.transport.open_count(), 2);
        h.transport.refuse();
        settle().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Reconnecting);

        wait(Duration::from_secs(4)).await;
        assert_eq!(h.transport.open_count(), 3);
        h.transport.refuse();
        settle().await;

        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.phase, Phase::Polling);
        assert!(snapshot.degraded);
        assert_eq!(h.updates.requests.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.len("equipment"), 1);

        wait(Duration::from_secs(30)).await;
        assert_eq!(h.transport.open_count(), 3);
        assert_eq!(h.updates.requests.load(Ordering::SeqCst), 4);
        assert_eq!(h.store.len("equipment"), 1);
        assert!(h
            .updates
            .tokens
            .lock()
            .unwrap()
            .iter()
            .all(|t| t.as_deref() == Some("token-1")));

        let mut phases = Vec::new();
        while let Ok(next) = status.try_recv() {
            phases.push(next.phase);
        }
        assert_eq!(phases.last(), Some(&Phase::Polling));
        assert_eq!(phases.iter().filter(|p| **p == Phase::Polling).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_while_reconnecting_is_final() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        h.transport.refuse();
        settle().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Reconnecting);

        h.handle.teardown().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Closed);

        wait(Duration::from_secs(120)).await;
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.handle.snapshot().phase, Phase::Closed);

        // Teardown again is a no-op and still answers.
        h.handle.teardown().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_while_polling_stops_requests_and_clears_collections() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        for delay in [2, 4] {
            h.transport.refuse();
            settle().await;
            wait(Duration::from_secs(delay)).await;
        }
        h.transport.refuse();
        settle().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Polling);

        h.store.apply_optimistic(
            "tasks",
            crate::reconcile::EntityEvent::Create(
                serde_json::json!({"id": "t9"}).as_object().cloned().unwrap(),
            ),
        );

        h.handle.teardown().await;
        let requests = h.updates.requests.load(Ordering::SeqCst);
        wait(Duration::from_secs(60)).await;
        assert_eq!(h.updates.requests.load(Ordering::SeqCst), requests);
        assert_eq!(h.store.len("tasks"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_identity_from_polling_redials_with_new_token() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        for delay in [2, 4] {
            h.transport.refuse();
            settle().await;
            wait(Duration::from_secs(delay)).await;
        }
        h.transport.refuse();
        settle().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Polling);

        h.tokens.set(Some("impersonated".into()));
        h.handle.send(SupervisorCommand::SwitchIdentity).await;
        settle().await;

        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.phase, Phase::Connecting);
        assert_eq!(snapshot.attempt, 0);
        assert!(!snapshot.degraded);
        let (url, _) = h.transport.log.lock().unwrap().opened[3].clone();
        assert!(url.ends_with("token=impersonated"));

        h.transport.accept();
        settle().await;
        assert_eq!(h.handle.snapshot().phase, Phase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_superseded_connection_are_ignored() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        h.transport.accept();
        settle().await;
        h.transport.hang_up();
        settle().await;
        wait(Duration::from_secs(1)).await;
        assert_eq!(h.transport.open_count(), 2);

        // Late frame and close from connection 1.
        h.transport.emit(ChannelEvent::Message {
            connection: 1,
            text: r#"{"type":"entity_create","entityType":"tasks","data":{"id":"old"}}"#.into(),
        });
        h.transport.emit(ChannelEvent::Closed {
            connection: 1,
            reason: None,
        });
        settle().await;

        assert_eq!(h.handle.snapshot().phase, Phase::Connecting);
        assert_eq!(h.store.len("tasks"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_and_presence_go_out_only_while_open() {
        let h = harness(vec![]);
        h.handle
            .send(SupervisorCommand::SendChat {
                message: "early".into(),
            })
            .await;
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        h.transport.accept();
        settle().await;

        h.handle
            .send(SupervisorCommand::SendChat {
                message: "Concrete truck is here".into(),
            })
            .await;
        h.handle
            .send(SupervisorCommand::PingPresence {
                status: PresenceStatus::Away,
            })
            .await;
        settle().await;

        let sent = h.transport.sent();
        assert_eq!(
            sent[1..].to_vec(),
            vec![
                ClientMessage::ChatMessage {
                    message: "Concrete truck is here".into()
                },
                ClientMessage::PresencePing {
                    status: Some(PresenceStatus::Away)
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_closes_the_channel() {
        let h = harness(vec![]);
        h.handle.send(SupervisorCommand::Start).await;
        settle().await;
        h.transport.accept();
        settle().await;

        let transport = h.transport.clone();
        drop(h);
        settle().await;

        assert!(transport.log.lock().unwrap().closes >= 1);
    }
}
