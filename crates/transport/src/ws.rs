//! WebSocket transport backed by tokio-tungstenite

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sitesync_protocol::ClientMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{ChannelEvent, ConnectionId, Transport, TransportError};

/// Frames queued for the connection task
enum Outbound {
    Text(String),
    Close,
}

struct ActiveConnection {
    id: ConnectionId,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport holding at most one live WebSocket.
pub struct WsTransport {
    active: Option<ActiveConnection>,
    connect_timeout: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self {
            active: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on TCP connect plus the upgrade handshake.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Transport for WsTransport {
    fn open(&mut self, url: &str, connection: ConnectionId, events: mpsc::Sender<ChannelEvent>) {
        if let Some(previous) = self.active.as_ref() {
            warn!(
                component = "transport",
                event = "transport.open.replacing",
                previous_connection = previous.id,
                connection_id = connection,
                "Closing previous connection before opening a new one"
            );
            self.close();
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_connection(
            url.to_string(),
            connection,
            self.connect_timeout,
            outbound_rx,
            events,
            Arc::clone(&open),
        ));

        self.active = Some(ActiveConnection {
            id: connection,
            outbound_tx,
            open,
            task,
        });
    }

    fn send(&mut self, message: &ClientMessage) {
        let Some(active) = self.active.as_ref().filter(|a| a.open.load(Ordering::Acquire)) else {
            debug!(
                component = "transport",
                event = "transport.send.dropped",
                message_type = message.type_name(),
                "Channel not open, message dropped"
            );
            return;
        };

        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                let error = TransportError::from(e);
                warn!(
                    component = "transport",
                    event = "transport.send.serialize_failed",
                    connection_id = active.id,
                    error = %error,
                    "Failed to serialize client message"
                );
                return;
            }
        };

        if active.outbound_tx.send(Outbound::Text(json)).is_err() {
            debug!(
                component = "transport",
                event = "transport.send.disconnected",
                connection_id = active.id,
                error = %TransportError::ChannelClosed,
                "Connection task gone, message dropped"
            );
        }
    }

    fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let was_open = active.open.swap(false, Ordering::AcqRel);
        if was_open {
            // Lets the task send a close frame before it exits.
            let _ = active.outbound_tx.send(Outbound::Close);
        } else {
            active.task.abort();
        }

        info!(
            component = "transport",
            event = "transport.closed",
            connection_id = active.id,
            was_open,
            "Connection closed by client"
        );
    }

    fn is_open(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.open.load(Ordering::Acquire))
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    url: String,
    connection: ConnectionId,
    connect_timeout: Duration,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::Sender<ChannelEvent>,
    open: Arc<AtomicBool>,
) {
    let dial = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str()));
    let error = match dial.await {
        Ok(Ok((socket, _response))) => {
            drive_socket(socket, connection, outbound_rx, events, open).await;
            return;
        }
        Ok(Err(e)) => TransportError::Connect(e),
        Err(_elapsed) => {
            warn!(
                component = "transport",
                event = "transport.connect.timeout",
                connection_id = connection,
                timeout_ms = connect_timeout.as_millis() as u64,
                "Handshake stalled, giving up on this dial"
            );
            TransportError::ConnectTimeout(connect_timeout)
        }
    };

    let _ = events
        .send(ChannelEvent::Failed { connection, error })
        .await;
}

async fn drive_socket(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    connection: ConnectionId,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::Sender<ChannelEvent>,
    open: Arc<AtomicBool>,
) {
    open.store(true, Ordering::Release);
    if events.send(ChannelEvent::Opened { connection }).await.is_err() {
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Text(json)) => {
                    if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                        open.store(false, Ordering::Release);
                        let _ = events
                            .send(ChannelEvent::Failed {
                                connection,
                                error: TransportError::Socket(e),
                            })
                            .await;
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    open.store(false, Ordering::Release);
                    return;
                }
            },
            frame = ws_rx.next() => {
                let event = match frame {
                    Some(Ok(Message::Text(text))) => ChannelEvent::Message {
                        connection,
                        text: text.as_str().to_string(),
                    },
                    Some(Ok(Message::Pong(_))) => ChannelEvent::Pong { connection },
                    Some(Ok(Message::Close(frame))) => {
                        open.store(false, Ordering::Release);
                        let _ = events
                            .send(ChannelEvent::Closed {
                                connection,
                                reason: frame.map(|f| f.reason.as_str().to_string()),
                            })
                            .await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        open.store(false, Ordering::Release);
                        let _ = events
                            .send(ChannelEvent::Failed {
                                connection,
                                error: TransportError::Socket(e),
                            })
                            .await;
                        return;
                    }
                    None => {
                        open.store(false, Ordering::Release);
                        let _ = events
                            .send(ChannelEvent::Closed {
                                connection,
                                reason: None,
                            })
                            .await;
                        return;
                    }
                };

                if events.send(event).await.is_err() {
                    // Nobody is listening any more.
                    open.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}
