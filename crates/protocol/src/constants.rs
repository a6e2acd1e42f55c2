use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often the hub sends WebSocket pings on each connection.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Read deadline for a connection.
///
/// If *nothing* arrives within this window (no pong, no heartbeat, no
/// message), the connection is considered dead and force-closed. Must be
/// comfortably larger than [`WS_PING_PERIOD`] so a single delayed pong
/// does not evict a healthy peer.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(30);

/// Maximum message size in bytes (4 MB). Task payloads are opaque JSON;
/// anything larger is a protocol violation.
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Capacity of the per-connection outbound queue. When full, the peer is
/// a slow consumer and the connection is closed rather than blocking the
/// dispatcher.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Timeout for request/response exchanges between cluster peers.
pub const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Agent lifecycle (agent -> hub)
    #[serde(rename = "agent_register")]
    AgentRegister,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "task_result")]
    TaskResult,

    // Client requests (client -> hub)
    #[serde(rename = "task_submit")]
    TaskSubmit,
    #[serde(rename = "task_cancel")]
    TaskCancel,

    // Hub responses and delegations
    #[serde(rename = "register_ack")]
    RegisterAck,
    #[serde(rename = "task_accepted")]
    TaskAccepted,
    #[serde(rename = "task_delegate")]
    TaskDelegate,
    #[serde(rename = "task_complete")]
    TaskComplete,

    // Cluster (hub <-> hub)
    #[serde(rename = "peer_announce")]
    PeerAnnounce,

    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Malformed or unexpected message; the connection is closed.
pub const ERR_CODE_PROTOCOL: i32 = 400;
/// Task id already known to the dispatcher.
pub const ERR_CODE_TASK_EXISTS: i32 = 409;
/// No local or remote agent can serve the task type.
pub const ERR_CODE_NO_CAPABLE_AGENT: i32 = 404;
/// Task id not known to the dispatcher (never seen or already terminal).
pub const ERR_CODE_UNKNOWN_TASK: i32 = 404;
/// Dispatcher backlog is full; submission rejected synchronously.
pub const ERR_CODE_QUEUE_CAPACITY: i32 = 429;
/// Deadline exceeded after exhausting retries.
pub const ERR_CODE_DISPATCH_TIMEOUT: i32 = 408;
/// Task cancelled by the requester.
pub const ERR_CODE_CANCELLED: i32 = 410;
pub const ERR_CODE_INTERNAL: i32 = 500;
pub const ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::AgentRegister).unwrap(),
            "\"agent_register\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::TaskDelegate).unwrap(),
            "\"task_delegate\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::PeerAnnounce).unwrap(),
            "\"peer_announce\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"task_submit\"").unwrap();
        assert_eq!(mt, MessageType::TaskSubmit);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"some_future_type\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn ping_period_below_pong_wait() {
        assert!(WS_PING_PERIOD < WS_PONG_WAIT);
    }
}
