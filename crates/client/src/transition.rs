//! Pure connection state transition function
//!
//! Every lifecycle rule of the realtime connection lives here as a pure,
//! synchronous function: `transition(state, input, policy, now) -> (state, effects)`.
//! No IO, no async, no timers. The supervisor executes the returned effects.

use std::time::{Duration, Instant};

use sitesync_protocol::{ClientMessage, PresenceStatus, ServerMessage};
use sitesync_transport::{ChannelEvent, ConnectionId};

use crate::scope::ScopeSubscription;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Polling,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Open => "open",
            Phase::Reconnecting => "reconnecting",
            Phase::Polling => "polling",
            Phase::Closed => "closed",
        }
    }

    /// Phases in which a session is live and an identity switch restarts it.
    fn is_live(&self) -> bool {
        matches!(
            self,
            Phase::Connecting | Phase::Open | Phase::Reconnecting | Phase::Polling
        )
    }
}

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`, saturating instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub phase: Phase,
    /// Consecutive failed connection attempts since the last Open.
    pub attempt: u32,
    pub scope: ScopeSubscription,
    pub last_heartbeat_ack: Option<Instant>,
    /// Id of the connection currently owned (or being dialed).
    pub connection: ConnectionId,
    /// Tag of the reconnect timer that is allowed to fire.
    pub reconnect_timer: u64,
    /// Tag of the poll cycle whose results are still wanted.
    pub poll_generation: u64,
    /// A poll request is outstanding; the next tick waits for it.
    pub poll_in_flight: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            attempt: 0,
            scope: ScopeSubscription::default(),
            last_heartbeat_ack: None,
            connection: 0,
            reconnect_timer: 0,
            poll_generation: 0,
            poll_in_flight: false,
        }
    }
}

impl ConnectionState {
    fn is_current(&self, connection: ConnectionId) -> bool {
        connection == self.connection
    }

    fn dial(&mut self, effects: &mut Vec<Effect>) {
        self.connection += 1;
        self.phase = Phase::Connecting;
        effects.push(Effect::OpenChannel {
            connection: self.connection,
        });
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    // Session lifecycle
    Start,
    Teardown,
    IdentityChanged,

    // Channel
    ChannelOpened {
        connection: ConnectionId,
    },
    FrameReceived {
        connection: ConnectionId,
        text: String,
    },
    PongReceived {
        connection: ConnectionId,
    },
    ChannelClosed {
        connection: ConnectionId,
        reason: Option<String>,
    },
    ChannelFailed {
        connection: ConnectionId,
        error: String,
    },

    // Timers
    ReconnectDue {
        timer: u64,
    },
    HeartbeatDue,
    PollDue,
    PollCompleted {
        generation: u64,
        updates: Vec<ServerMessage>,
    },

    // Caller requests
    JoinScope(String),
    LeaveScope,
    SendChat(String),
    PingPresence(PresenceStatus),
}

impl From<ChannelEvent> for Input {
    fn from(event: ChannelEvent) -> Self {
        match event {
            ChannelEvent::Opened { connection } => Input::ChannelOpened { connection },
            ChannelEvent::Message { connection, text } => {
                Input::FrameReceived { connection, text }
            }
            ChannelEvent::Pong { connection } => Input::PongReceived { connection },
            ChannelEvent::Closed { connection, reason } => {
                Input::ChannelClosed { connection, reason }
            }
            ChannelEvent::Failed { connection, error } => Input::ChannelFailed {
                connection,
                error: error.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Effects: IO for the supervisor to execute
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Dial a new physical connection with a freshly fetched token.
    OpenChannel { connection: ConnectionId },
    CloseChannel,
    /// Send `join_user_channel` with the current bearer token.
    Authenticate,
    Send(ClientMessage),
    StartHeartbeat,
    StopHeartbeat,
    ScheduleReconnect { timer: u64, delay: Duration },
    CancelReconnect,
    StartPolling,
    StopPolling,
    RequestUpdates { generation: u64 },
    DispatchFrame(String),
    DispatchUpdates(Vec<ServerMessage>),
    ClearCollections,
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Pure, synchronous state transition.
///
/// Given the current state and an input, returns the new state and the
/// effects (socket operations, timers, dispatches) to execute in order.
pub fn transition(
    mut state: ConnectionState,
    input: Input,
    policy: &ReconnectPolicy,
    now: Instant,
) -> (ConnectionState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        // -- Session lifecycle ------------------------------------------------
        Input::Start => {
            if matches!(state.phase, Phase::Idle | Phase::Closed) {
                state.attempt = 0;
                state.last_heartbeat_ack = None;
                state.dial(&mut effects);
            }
        }

        Input::Teardown => {
            if state.phase != Phase::Closed {
                effects.push(Effect::StopHeartbeat);
                effects.push(Effect::CancelReconnect);
                effects.push(Effect::StopPolling);
                effects.push(Effect::CloseChannel);
                effects.push(Effect::ClearCollections);

                state.phase = Phase::Closed;
                state.attempt = 0;
                state.scope.clear();
                state.reconnect_timer += 1;
                state.poll_generation += 1;
                state.poll_in_flight = false;
            }
        }

        Input::IdentityChanged => {
            if state.phase.is_live() {
                effects.push(Effect::StopHeartbeat);
                effects.push(Effect::CancelReconnect);
                effects.push(Effect::StopPolling);
                effects.push(Effect::CloseChannel);
                effects.push(Effect::ClearCollections);

                state.attempt = 0;
                state.last_heartbeat_ack = None;
                state.scope.clear();
                state.reconnect_timer += 1;
                state.poll_generation += 1;
                state.poll_in_flight = false;
                state.dial(&mut effects);
            }
        }

        // -- Channel ----------------------------------------------------------
        Input::ChannelOpened { connection } => {
            if state.is_current(connection) && state.phase == Phase::Connecting {
                state.phase = Phase::Open;
                state.attempt = 0;
                state.last_heartbeat_ack = Some(now);

                effects.push(Effect::Authenticate);
                if let Some(join) = state.scope.replay() {
                    effects.push(Effect::Send(join));
                }
                effects.push(Effect::StartHeartbeat);
            }
        }

        Input::FrameReceived { connection, text } => {
            if state.is_current(connection) && state.phase == Phase::Open {
                state.last_heartbeat_ack = Some(now);
                effects.push(Effect::DispatchFrame(text));
            }
        }

        Input::PongReceived { connection } => {
            if state.is_current(connection) && state.phase == Phase::Open {
                state.last_heartbeat_ack = Some(now);
            }
        }

        Input::ChannelClosed { connection, .. } | Input::ChannelFailed { connection, .. } => {
            if state.is_current(connection) {
                match state.phase {
                    Phase::Open => {
                        effects.push(Effect::StopHeartbeat);
                        effects.push(Effect::CloseChannel);
                        schedule_reconnect(&mut state, policy, &mut effects);
                    }
                    Phase::Connecting => {
                        effects.push(Effect::CloseChannel);
                        state.attempt += 1;
                        if state.attempt >= policy.max_attempts {
                            state.phase = Phase::Polling;
                            state.poll_generation += 1;
                            state.poll_in_flight = false;
                            effects.push(Effect::StartPolling);
                        } else {
                            schedule_reconnect(&mut state, policy, &mut effects);
                        }
                    }
                    _ => {}
                }
            }
        }

        // -- Timers -----------------------------------------------------------
        Input::ReconnectDue { timer } => {
            if state.phase == Phase::Reconnecting && timer == state.reconnect_timer {
                state.dial(&mut effects);
            }
        }

        Input::HeartbeatDue => {
            if state.phase == Phase::Open {
                effects.push(Effect::Send(ClientMessage::PresencePing { status: None }));
            }
        }

        Input::PollDue => {
            if state.phase == Phase::Polling && !state.poll_in_flight {
                state.poll_in_flight = true;
                effects.push(Effect::RequestUpdates {
                    generation: state.poll_generation,
                });
            }
        }

        Input::PollCompleted {
            generation,
            updates,
        } => {
            if state.phase == Phase::Polling && generation == state.poll_generation {
                state.poll_in_flight = false;
                if !updates.is_empty() {
                    effects.push(Effect::DispatchUpdates(updates));
                }
            }
        }

        // -- Caller requests --------------------------------------------------
        Input::JoinScope(id) => {
            let connected = state.phase == Phase::Open;
            if let Some(join) = state.scope.join(id, connected) {
                effects.push(Effect::Send(join));
            }
        }

        Input::LeaveScope => {
            let connected = state.phase == Phase::Open;
            if let Some(leave) = state.scope.leave(connected) {
                effects.push(Effect::Send(leave));
            }
        }

        Input::SendChat(message) => {
            if state.phase == Phase::Open {
                effects.push(Effect::Send(ClientMessage::ChatMessage { message }));
            }
        }

        Input::PingPresence(status) => {
            if state.phase == Phase::Open {
                effects.push(Effect::Send(ClientMessage::PresencePing {
                    status: Some(status),
                }));
            }
        }
    }

    (state, effects)
}

fn schedule_reconnect(
    state: &mut ConnectionState,
    policy: &ReconnectPolicy,
    effects: &mut Vec<Effect>,
) {
    state.phase = Phase::Reconnecting;
    state.reconnect_timer += 1;
    effects.push(Effect::ScheduleReconnect {
        timer: state.reconnect_timer,
        delay: policy.delay_for(state.attempt),
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
