use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TaskOutcome;

// ---------------------------------------------------------------------------
// Agent lifecycle payloads
// ---------------------------------------------------------------------------

/// Registers an agent and its capabilities with the hub.
///
/// `agent_id` is client-supplied and stable across reconnects; registering
/// the same id again is idempotent (last registration wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegisterRequest {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    /// Relative capacity used by the weighted strategy.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Hub's acknowledgment of a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAckResponse {
    pub agent_id: String,
    /// Interval at which the hub expects heartbeats.
    pub heartbeat_interval_secs: u64,
}

/// Periodic liveness signal from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatEvent {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    /// In-flight task count as seen by the agent itself.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub current_load: u32,
}

// ---------------------------------------------------------------------------
// Task payloads
// ---------------------------------------------------------------------------

/// Submits a task for dispatch to a capable agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmitRequest {
    pub task_id: String,
    pub task_type: String,
    pub payload: Box<serde_json::value::RawValue>,
    /// Per-task deadline override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Set on tasks forwarded from a peer hub; forwarded tasks are never
    /// re-forwarded (single-hop rule).
    #[serde(default, skip_serializing_if = "is_false")]
    pub forwarded: bool,
}

/// Hub's synchronous acknowledgment that a task entered the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAcceptedResponse {
    pub task_id: String,
}

/// Delegates a task to a specific agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDelegateRequest {
    pub task_id: String,
    pub task_type: String,
    pub payload: Box<serde_json::value::RawValue>,
}

/// Terminal outcome of a task.
///
/// Sent agent -> hub as `task_result` and forwarded hub -> client as
/// `task_complete` with the payload untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultPayload {
    pub task_id: String,
    pub status: TaskOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cancels a queued or dispatched task.
///
/// Also sent hub -> agent as a best-effort cancel notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancelRequest {
    pub task_id: String,
}

// ---------------------------------------------------------------------------
// Cluster payloads
// ---------------------------------------------------------------------------

/// One locally registered agent as seen by a peer hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAgentSummary {
    pub agent_id: String,
    pub capabilities: Vec<String>,
}

/// Periodic publication of a hub's locally registered agent set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnounceEvent {
    pub node_id: String,
    pub agents: Vec<PeerAgentSummary>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> Box<serde_json::value::RawValue> {
        serde_json::value::RawValue::from_string(json.to_string()).unwrap()
    }

    #[test]
    fn register_default_weight() {
        let json = r#"{"agentId":"a1","agentType":"worker","capabilities":["echo"]}"#;
        let req: AgentRegisterRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.weight, 1);
        assert_eq!(req.capabilities, vec!["echo"]);
    }

    #[test]
    fn register_explicit_weight() {
        let json = r#"{"agentId":"a1","agentType":"worker","capabilities":[],"weight":3}"#;
        let req: AgentRegisterRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.weight, 3);
    }

    #[test]
    fn heartbeat_roundtrip() {
        let hb = HeartbeatEvent {
            agent_id: "a1".into(),
            timestamp: Utc::now(),
            current_load: 0,
        };
        let json = serde_json::to_string(&hb).unwrap();
        // Zero load is omitted on the wire.
        assert!(!json.contains("currentLoad"));
        let parsed: HeartbeatEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.agent_id, "a1");
        assert_eq!(parsed.current_load, 0);
    }

    #[test]
    fn submit_forwarded_marker_omitted_when_false() {
        let req = TaskSubmitRequest {
            task_id: "t1".into(),
            task_type: "echo".into(),
            payload: raw(r#""hi""#),
            timeout_secs: None,
            forwarded: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("forwarded"));
        assert!(!json.contains("timeoutSecs"));
    }

    #[test]
    fn submit_forwarded_marker_survives_roundtrip() {
        let req = TaskSubmitRequest {
            task_id: "t1".into(),
            task_type: "echo".into(),
            payload: raw("{}"),
            timeout_secs: Some(30),
            forwarded: true,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"forwarded\":true"));
        let parsed: TaskSubmitRequest = serde_json::from_str(&json).unwrap();
        assert!(parsed.forwarded);
        assert_eq!(parsed.timeout_secs, Some(30));
    }

    #[test]
    fn result_payload_preserved_verbatim() {
        let res = TaskResultPayload {
            task_id: "t1".into(),
            status: TaskOutcome::Completed,
            result: Some(raw(r#"{"answer":42}"#)),
            error: None,
        };
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains(r#""result":{"answer":42}"#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn result_error_variant() {
        let json = r#"{"taskId":"t1","status":"error","error":"boom"}"#;
        let res: TaskResultPayload = serde_json::from_str(json).unwrap();
        assert_eq!(res.status, TaskOutcome::Error);
        assert_eq!(res.error.as_deref(), Some("boom"));
        assert!(res.result.is_none());
    }

    #[test]
    fn peer_announce_roundtrip() {
        let ev = PeerAnnounceEvent {
            node_id: "node-a".into(),
            agents: vec![PeerAgentSummary {
                agent_id: "a1".into(),
                capabilities: vec!["echo".into(), "search".into()],
            }],
        };
        let json = serde_json::to_string(&ev).unwrap();
        let parsed: PeerAnnounceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ev);
    }
}
