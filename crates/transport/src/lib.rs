//! SiteSync Transport
//!
//! The transport channel owns at most one physical duplex connection and
//! reports its lifecycle as [`ChannelEvent`]s. Everything above it (auth,
//! heartbeat, reconnect) lives in the connection supervisor.

pub mod ws;

pub use ws::WsTransport;

use sitesync_protocol::ClientMessage;
use thiserror::Error;
use tokio::sync::mpsc;

/// Monotonic id assigned by the caller to each `open`. Events carry it so a
/// late event from a superseded connection can be told apart.
pub type ConnectionId = u64;

/// Errors that can occur on the transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("Handshake did not complete within {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Socket error: {0}")]
    Socket(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,
}

/// Events emitted by a transport for one connection
#[derive(Debug)]
pub enum ChannelEvent {
    /// The physical connection is established
    Opened { connection: ConnectionId },

    /// A text frame arrived
    Message {
        connection: ConnectionId,
        text: String,
    },

    /// The peer answered a ping at the socket level
    Pong { connection: ConnectionId },

    /// The connection ended without an explicit `close()` from our side
    Closed {
        connection: ConnectionId,
        reason: Option<String>,
    },

    /// The connection could not be established or broke with an error
    Failed {
        connection: ConnectionId,
        error: TransportError,
    },
}

/// A duplex channel carrying JSON text frames.
///
/// `open` must never leave two live connections behind: implementations
/// close whatever they still hold before dialing again. `send` never fails
/// outward; frames sent while not open are dropped and logged. `close` is
/// idempotent and does not emit a `Closed` event. A dial that neither opens
/// nor fails within the implementation's connect timeout reports `Failed`.
pub trait Transport: Send + 'static {
    fn open(&mut self, url: &str, connection: ConnectionId, events: mpsc::Sender<ChannelEvent>);

    fn send(&mut self, message: &ClientMessage);

    fn close(&mut self);

    fn is_open(&self) -> bool;
}
