//! WebSocket client transport.
//!
//! [`connect`] opens a socket to a sync server and returns a channel pair:
//! messages sent on [`ClientConnection::sender`] are framed and written by a
//! writer task, and frames read by a reader task arrive decoded on
//! [`ClientConnection::recv`]. An [`EditorBinding`](crate::editor::EditorBinding)
//! plugs straight into the sender.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::sync::protocol::{ClientMessage, ProtocolError, ServerMessage, SyncProtocol};

/// Client transport errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,
}

/// A live connection to the sync server
pub struct ClientConnection {
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// Connect to a sync server WebSocket endpoint, e.g. `ws://host:port/ws/room-1`
pub async fn connect(url: &str) -> Result<ClientConnection, ClientError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Writer task: frame outgoing messages
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let data = match SyncProtocol::encode_client(&msg) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Failed to encode {:?}: {}", msg.message_type(), e);
                    continue;
                }
            };
            if ws_writer.send(Message::Binary(data.to_vec())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Reader task: decode incoming frames
    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(Message::Binary(data)) => match SyncProtocol::decode_server(&data) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable server frame: {}", e),
                },
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable text frame: {}", e),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        debug!("Server connection closed");
    });

    Ok(ClientConnection {
        tx: out_tx,
        rx: in_rx,
        writer,
        reader,
    })
}

impl ClientConnection {
    /// Sender for outgoing messages; clone it into an editor binding
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.tx.clone()
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.tx.send(msg).map_err(|_| ClientError::Closed)
    }

    /// Next message from the server; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Close the socket after flushing queued messages
    pub async fn close(self) {
        let ClientConnection {
            tx,
            rx,
            writer,
            reader,
        } = self;
        drop(tx);
        drop(rx);
        let _ = writer.await;
        reader.abort();
    }
}
