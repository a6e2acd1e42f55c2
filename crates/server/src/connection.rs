//! Per-peer connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use corral_protocol::constants::{
    ERR_CODE_NOT_IMPLEMENTED, ERR_CODE_PROTOCOL, MessageType, SEND_BUFFER_SIZE,
    WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use corral_protocol::envelope::Message;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::handler::Handler;

/// Metadata about a connected peer.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub connection_id: Uuid,
    pub remote_addr: String,
}

/// Handle for sending messages to a connected peer.
///
/// Cloneable and cheap. The underlying queue is bounded; a peer that
/// cannot drain it fast enough is a slow consumer and gets disconnected
/// rather than ever blocking the caller.
#[derive(Clone)]
pub struct Sender {
    connection_id: Uuid,
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// A full queue closes the connection (drop-slow-consumer policy).
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        match self.tx.try_send(WsMessage::Text(json.into())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "send queue full, closing slow consumer"
                );
                self.cancel.cancel();
                Err(SendError)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError),
        }
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// The id of the connection this sender writes to.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Signals the connection to close.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Error returned when the send queue is full or the connection closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: queue full or connection closed")]
pub struct SendError;

/// Active connection to a peer.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct Connection {
    pub meta: ConnMeta,
    sender: Sender,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Connection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals shutdown without waiting.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Signals shutdown and waits for the read pump to finish, including
    /// its disconnect cleanup.
    pub async fn close_and_wait(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }

    /// Returns `true` once the read pump has fully exited.
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }
}

/// Runs the read and write pumps for an accepted WebSocket connection.
///
/// The pumps run as background tokio tasks and stop when the peer
/// disconnects or the cancel token is triggered. [`Handler::on_disconnect`]
/// fires exactly once, after the read pump exits.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: ConnMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> Connection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let done = CancellationToken::new();
    let sender = Sender {
        connection_id: meta.connection_id,
        tx,
        cancel: cancel.clone(),
    };

    let conn = Connection {
        meta: meta.clone(),
        sender: sender.clone(),
        cancel: cancel.clone(),
        done: done.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    // Write pump.
    let write_cancel = cancel.clone();
    tokio::spawn(write_pump(ws_sink, rx, write_cancel));

    // Read pump.
    let read_cancel = cancel.clone();
    let read_sender = sender.clone();
    tokio::spawn(async move {
        read_pump(ws_stream, read_sender, handler.clone(), read_cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        read_cancel.cancel();
        handler.on_disconnect(meta.connection_id).await;
        tracing::debug!(connection_id = %meta.connection_id, "peer disconnected");
        done.cancel();
    });

    conn
}

/// Write pump: drains the send queue and sends WS pings.
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
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches to the handler.
///
/// Any inbound traffic counts toward the liveness deadline, so a peer
/// that keeps sending heartbeats but drops pongs is not evicted.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut idle_deadline = tokio::time::interval(WS_PONG_WAIT);
    idle_deadline.reset();
    let mut got_traffic = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = idle_deadline.tick() => {
                if !got_traffic {
                    tracing::warn!(
                        connection_id = %sender.connection_id,
                        "idle timeout, closing connection"
                    );
                    break;
                }
                got_traffic = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        got_traffic = true;
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!(
                                        connection_id = %sender.connection_id,
                                        "message exceeds max size ({} > {})",
                                        text.len(),
                                        WS_MAX_MESSAGE_SIZE
                                    );
                                    break;
                                }
                                if !dispatch_text(&handler, &sender, &text).await {
                                    break;
                                }
                            }
                            WsMessage::Binary(_) => {
                                // The hub protocol is text-only.
                                tracing::error!(
                                    connection_id = %sender.connection_id,
                                    "unexpected binary frame, closing"
                                );
                                break;
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Ping(data) => {
                                // Auto-respond to pings from the peer.
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::debug!(
                                    connection_id = %sender.connection_id,
                                    "received close frame"
                                );
                                break;
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the appropriate handler method.
///
/// Returns `false` when the connection must close (protocol error).
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) -> bool {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(
                connection_id = %sender.connection_id,
                "malformed message, closing: {e}"
            );
            let _ = sender.send_msg(Message::error("", ERR_CODE_PROTOCOL, "malformed message"));
            return false;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::AgentRegister => handler.on_agent_register(s, msg).await,
        MessageType::Heartbeat => handler.on_heartbeat(s, msg).await,
        MessageType::TaskSubmit => handler.on_task_submit(s, msg).await,
        MessageType::TaskResult => handler.on_task_result(s, msg).await,
        MessageType::TaskCancel => handler.on_task_cancel(s, msg).await,
        MessageType::PeerAnnounce => handler.on_peer_announce(s, msg).await,
        MessageType::Error => {
            // Error frames from peers are informational.
            if let Some(err) = &msg.error {
                tracing::warn!(
                    connection_id = %sender.connection_id,
                    code = err.code,
                    "peer error: {}",
                    err.message
                );
            }
        }
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
        }
    }
    true
}
