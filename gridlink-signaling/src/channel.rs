//! Signaling transport: the bidirectional channel offers, answers and
//! candidates travel on

use crate::protocol::SignalingEnvelope;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gridlink_core::GridError;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of a signaling transport
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send an addressed message
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), GridError>;
}

/// Signaling channel over a WebSocket relay
///
/// Every envelope is one JSON text frame. Inbound envelopes addressed to the
/// local user are delivered on the receiver returned by [`connect`](Self::connect).
pub struct WebSocketSignalingChannel {
    url: String,
    local_user_id: String,
    tx: mpsc::UnboundedSender<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketSignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSignalingChannel")
            .field("url", &self.url)
            .field("local_user_id", &self.local_user_id)
            .finish()
    }
}

impl WebSocketSignalingChannel {
    /// Connect to the relay and start the send and receive tasks
    pub async fn connect(
        url: &str,
        local_user_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEnvelope>), GridError> {
        info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| GridError::Transport {
                reason: format!("Failed to connect to signaling relay {}: {}", url, e),
            })?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let sender = tokio::spawn(Self::sender_task(write, rx));
        let receiver = tokio::spawn(Self::receiver_task(
            read,
            local_user_id.to_string(),
            incoming_tx,
        ));

        info!("Connected to signaling relay as {}", local_user_id);

        Ok((
            Self {
                url: url.to_string(),
                local_user_id: local_user_id.to_string(),
                tx,
                tasks: Mutex::new(vec![sender, receiver]),
            },
            incoming_rx,
        ))
    }

    /// Local participant ID
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Stop both tasks
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("Signaling channel to {} closed", self.url);
    }

    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send signaling frame: {}", e);
                break;
            }
        }
        let _ = write.close().await;
        debug!("Signaling sender task terminated");
    }

    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        local_user_id: String,
        incoming: mpsc::UnboundedSender<SignalingEnvelope>,
    ) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match SignalingEnvelope::from_json(&text) {
                    Ok(envelope) if envelope.to_user_id == local_user_id => {
                        if incoming.send(envelope).is_err() {
                            break;
                        }
                    }
                    Ok(envelope) => {
                        debug!(
                            "Ignoring {} addressed to {}",
                            envelope.message.kind(),
                            envelope.to_user_id
                        );
                    }
                    Err(e) => warn!("Dropping signaling frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Signaling relay closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Signaling socket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
        debug!("Signaling receiver task terminated");
    }
}

impl Drop for WebSocketSignalingChannel {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignalingChannel {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), GridError> {
        let text = envelope.to_json()?;
        self.tx
            .send(Message::Text(text))
            .map_err(|_| GridError::Signaling {
                participant_id: envelope.to_user_id.clone(),
                reason: "signaling channel closed".to_string(),
            })
    }
}
