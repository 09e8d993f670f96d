// =============================================================================
// Stream Transport — socket seam between the core and the network
// =============================================================================
//
// A connection is an outbound command handle plus an ordered event channel:
//   Open → Message* → (Error)? → Closed
// `Closed` is emitted exactly once, whichever side ends the connection.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Event surfaced by an open socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed,
}

/// Command sent from a [`TransportHandle`] to the socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Cheap, cloneable sender half of a connection.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    url: Arc<str>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Build a handle and the receiver the socket task drains.
    pub fn channel(url: &str) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            url: Arc::from(url),
            outbound: tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn send(&self, payload: impl Into<String>) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.outbound
            .send(Outbound::Text(payload.into()))
            .map_err(|_| SyncError::Transport(format!("socket task for {} is gone", self.url)))
    }

    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A connected socket: the handle to talk to it and the events it produces.
#[derive(Debug)]
pub struct Connection {
    pub handle: TransportHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// Wait for the transport's confirmed-open event.
    ///
    /// Anything other than `Open` as the first event means the connection
    /// never became usable; the handle is closed and a transport error is
    /// returned.
    pub async fn opened(mut self) -> SyncResult<Self> {
        match self.events.recv().await {
            Some(TransportEvent::Open) => Ok(self),
            Some(TransportEvent::Error(e)) => {
                self.handle.close();
                Err(SyncError::Transport(e))
            }
            Some(other) => {
                self.handle.close();
                Err(SyncError::Transport(format!(
                    "{} produced {other:?} before opening",
                    self.handle.url()
                )))
            }
            None => Err(SyncError::Transport(format!(
                "{} closed before opening",
                self.handle.url()
            ))),
        }
    }
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, url: &str) -> SyncResult<Connection>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

/// WebSocket transport backed by tokio-tungstenite. One task per connection.
#[derive(Debug, Default, Clone)]
pub struct TungsteniteTransport;

#[async_trait]
impl StreamTransport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> SyncResult<Connection> {
        info!(url = %url, "connecting WebSocket");

        let (ws_stream, _response) = connect_async(url).await?;

        let (handle, outbound) = TransportHandle::channel(url);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(TransportEvent::Open);

        tokio::spawn(run_socket(ws_stream, outbound, events_tx, url.to_string()));

        Ok(Connection {
            handle,
            events: events_rx,
        })
    }
}

async fn run_socket<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    url: String,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!(url = %url, error = %e, "WebSocket send failed");
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!(url = %url, "closing WebSocket");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text));
                }
                Some(Ok(Message::Binary(bin))) => {
                    if let Ok(text) = String::from_utf8(bin) {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                }
                // tungstenite queues pong replies itself.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    info!(url = %url, frame = ?frame, "WebSocket closed by peer");
                    break;
                }
                Some(Err(e)) => {
                    warn!(url = %url, error = %e, "WebSocket read error");
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    warn!(url = %url, "WebSocket stream ended");
                    break;
                }
            }
        }
    }

    let _ = events.send(TransportEvent::Closed);
}
