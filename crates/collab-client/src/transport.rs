//! WebSocket transport to the collaboration relay.
//!
//! A connection attempt runs as its own task: it connects, hands the write half
//! back to the session, then forwards every inbound text frame until the socket
//! ends. Every event carries the `epoch` of the attempt that produced it so the
//! session can ignore stragglers from sockets it already gave up on.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

/// Maximum accepted frame size (16MB). Board states can be large.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Event emitted by a connection attempt.
#[derive(Debug)]
pub enum TransportEvent {
    /// Socket is open; frames can be written through `writer`.
    Opened { epoch: u64, writer: WsWriter },
    /// A text frame arrived.
    Frame { epoch: u64, text: String },
    /// Socket ended (close frame, error, or EOF).
    Closed { epoch: u64 },
    /// The connection attempt itself failed.
    Failed { epoch: u64, error: TransportError },
}

impl TransportEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            TransportEvent::Opened { epoch, .. }
            | TransportEvent::Frame { epoch, .. }
            | TransportEvent::Closed { epoch }
            | TransportEvent::Failed { epoch, .. } => *epoch,
        }
    }
}

/// Write half of a relay socket.
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

impl std::fmt::Debug for WsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsWriter").finish_non_exhaustive()
    }
}

impl WsWriter {
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Send a normal (1000) close frame. Errors are ignored; the socket is
    /// going away either way.
    pub async fn close(mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!("Close frame not delivered: {}", e);
        }
        let _ = self.sink.close().await;
    }
}

/// Spawn a connection attempt to `url`.
///
/// The returned handle covers the whole socket lifetime; aborting it stops
/// the read loop.
pub fn spawn_connect(
    url: String,
    epoch: u64,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Connecting to {} (epoch {})", url, epoch);
        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                warn!("Connection to {} failed: {}", url, e);
                let _ = event_tx.send(TransportEvent::Failed {
                    epoch,
                    error: TransportError::Connect(e.to_string()),
                });
                return;
            }
        };

        let (sink, stream) = ws_stream.split();
        if event_tx
            .send(TransportEvent::Opened {
                epoch,
                writer: WsWriter { sink },
            })
            .is_err()
        {
            // Session is gone.
            return;
        }

        read_loop(url, epoch, stream, event_tx).await;
    })
}

/// Read loop that forwards text frames to the event channel.
async fn read_loop(
    url: String,
    epoch: u64,
    mut read: SplitStream<WsStream>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let text = match msg {
                    Message::Text(text) => text.to_string(),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Ignoring non-UTF-8 binary frame from {}", url);
                            continue;
                        }
                    },
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(frame) => {
                        debug!("Received close frame from {}: {:?}", url, frame);
                        break;
                    }
                    Message::Frame(_) => continue,
                };

                if text.len() > MAX_FRAME_SIZE {
                    warn!(
                        "Frame from {} exceeds max size ({} > {}), dropping",
                        url,
                        text.len(),
                        MAX_FRAME_SIZE
                    );
                    continue;
                }

                if event_tx.send(TransportEvent::Frame { epoch, text }).is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", url);
                    }
                    _ => {
                        error!("WebSocket error on {}: {}", url, e);
                    }
                }
                break;
            }
            None => {
                debug!("Connection {} stream ended", url);
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Closed { epoch });
}
