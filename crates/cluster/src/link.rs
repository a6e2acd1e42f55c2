//! Outbound WebSocket link to a peer hub.
//!
//! Implements request-response with envelope-id correlation. A single
//! request id may receive several correlated messages (`task_accepted`
//! followed by `task_complete`), so pending entries carry a channel
//! rather than a oneshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use corral_protocol::constants::{
    MessageType, SEND_BUFFER_SIZE, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use corral_protocol::envelope::Message;

use crate::ClusterError;

type PendingMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;

/// WebSocket client connected to a single peer hub.
pub struct PeerLink {
    node_id: String,
    write_tx: mpsc::Sender<WsMessage>,
    pending: PendingMap,
    cancel: CancellationToken,
}

impl PeerLink {
    /// Dials a peer hub.
    pub async fn connect(node_id: impl Into<String>, url: &str) -> Result<Self, ClusterError> {
        let node_id = node_id.into();
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (sink, stream) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(write_pump(sink, write_rx, cancel.clone()));
        tokio::spawn(read_pump(
            stream,
            Arc::clone(&pending),
            write_tx.clone(),
            cancel.clone(),
            node_id.clone(),
        ));

        tracing::info!(peer = %node_id, url, "peer link established");
        Ok(Self {
            node_id,
            write_tx,
            pending,
            cancel,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns `true` while the link's pumps are running.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Closes the link and fails all pending requests.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Sends a fire-and-forget message (announcements).
    pub async fn send_event<T: serde::Serialize>(
        &self,
        id: &str,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<(), ClusterError> {
        let msg = Message::new(id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;
        self.write_tx
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| ClusterError::Closed)
    }

    /// Sends a request and waits for a terminal response.
    ///
    /// Intermediate messages with the same id (acknowledgments) are
    /// skipped; the first `task_complete` or `error` wins. The whole
    /// exchange is bounded by `timeout`.
    pub async fn request<T: serde::Serialize>(
        &self,
        id: &str,
        msg_type: MessageType,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<Message, ClusterError> {
        let msg = Message::new(id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(id.to_string(), tx);

        let send_result = self
            .write_tx
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| ClusterError::Closed);
        if let Err(e) = send_result {
            self.pending.lock().await.remove(id);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Some(msg) if msg.msg_type == MessageType::TaskAccepted => continue,
                    Some(msg) => break Ok(msg),
                    None => break Err(ClusterError::Closed),
                }
            }
        })
        .await;

        self.pending.lock().await.remove(id);

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ClusterError::Timeout),
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("peer link write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Read pump: routes correlated responses to pending requests.
///
/// Any incoming traffic resets the liveness deadline. On exit the
/// pending map is drained so in-flight requests fail fast.
async fn read_pump<S>(
    mut stream: S,
    pending: PendingMap,
    write_tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
    node_id: String,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    let idle_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(idle_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut idle_deadline => {
                tracing::warn!(peer = %node_id, "peer link idle timeout");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        idle_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match ws_msg {
                            WsMessage::Text(text) => {
                                route_text(&text, &pending, &node_id).await;
                            }
                            WsMessage::Ping(data) => {
                                let _ = write_tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Close(_) => {
                                tracing::debug!(peer = %node_id, "peer sent close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(peer = %node_id, "peer link read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    cancel.cancel();
    // Fail all in-flight requests.
    pending.lock().await.clear();
    tracing::info!(peer = %node_id, "peer link closed");
}

/// Routes one text frame to its pending request, if any.
async fn route_text(text: &str, pending: &PendingMap, node_id: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(peer = %node_id, "malformed peer message: {e}");
            return;
        }
    };

    let map = pending.lock().await;
    if let Some(tx) = map.get(&msg.id) {
        let _ = tx.send(msg);
    } else {
        tracing::debug!(
            peer = %node_id,
            msg_type = ?msg.msg_type,
            id = %msg.id,
            "uncorrelated peer message, dropping"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn route_text_delivers_to_pending() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        pending.lock().await.insert("req-1".into(), tx);

        let msg = Message::new::<()>("req-1", MessageType::TaskComplete, None).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        route_text(&json, &pending, "n1").await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "req-1");
        assert_eq!(received.msg_type, MessageType::TaskComplete);
    }

    #[tokio::test]
    async fn route_text_delivers_multiple_correlated_messages() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        pending.lock().await.insert("t-1".into(), tx);

        let accepted = Message::new::<()>("t-1", MessageType::TaskAccepted, None).unwrap();
        let complete = Message::new::<()>("t-1", MessageType::TaskComplete, None).unwrap();
        route_text(&serde_json::to_string(&accepted).unwrap(), &pending, "n1").await;
        route_text(&serde_json::to_string(&complete).unwrap(), &pending, "n1").await;

        assert_eq!(rx.recv().await.unwrap().msg_type, MessageType::TaskAccepted);
        assert_eq!(rx.recv().await.unwrap().msg_type, MessageType::TaskComplete);
    }

    #[tokio::test]
    async fn route_text_ignores_uncorrelated() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let msg = Message::new::<()>("stray", MessageType::TaskComplete, None).unwrap();
        route_text(&serde_json::to_string(&msg).unwrap(), &pending, "n1").await;
    }

    #[tokio::test]
    async fn route_text_ignores_malformed() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        route_text("{broken", &pending, "n1").await;
    }
}
