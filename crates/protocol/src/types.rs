use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Liveness state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    /// Missed at least one heartbeat interval but still within the TTL.
    Degraded,
    Offline,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Dispatched,
    Completed,
    Failed,
    TimedOut,
}

impl TaskState {
    /// Returns `true` for states that end a task's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// Outcome reported by an agent in a `task_result` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Error,
}

/// Policy for choosing among eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Cyclic pointer over the eligible list, independent of load.
    #[default]
    RoundRobin,
    /// Probability proportional to each agent's weight.
    Weighted,
    /// Fewest in-flight tasks; ties broken by earliest registration.
    LeastConnections,
    /// EWMA of recent task latency; least_connections when no history.
    Adaptive,
}

impl FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "least_connections" => Ok(Self::LeastConnections),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown load balance strategy: {other}")),
        }
    }
}

/// Agent view exposed on the health surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub current_load: u32,
    pub weight: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_serialization() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(
            serde_json::to_string(&AgentStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn task_state_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskState::TimedOut).unwrap(),
            "\"timed_out\""
        );
        assert_eq!(
            serde_json::to_string(&TaskState::Dispatched).unwrap(),
            "\"dispatched\""
        );
    }

    #[test]
    fn task_state_terminal() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::TimedOut.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Dispatched.is_terminal());
    }

    #[test]
    fn strategy_from_str() {
        assert_eq!(
            "least_connections".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::LeastConnections
        );
        assert!("fastest".parse::<LoadBalanceStrategy>().is_err());
    }

    #[test]
    fn strategy_serde_matches_from_str() {
        let s = serde_json::to_string(&LoadBalanceStrategy::Adaptive).unwrap();
        assert_eq!(s, "\"adaptive\"");
        let parsed: LoadBalanceStrategy = serde_json::from_str(&s).unwrap();
        assert_eq!(parsed, LoadBalanceStrategy::Adaptive);
    }

    #[test]
    fn agent_summary_field_names() {
        let summary = AgentSummary {
            agent_id: "a1".into(),
            agent_type: "worker".into(),
            status: AgentStatus::Online,
            capabilities: vec!["echo".into()],
            current_load: 2,
            weight: 1,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"agentId\":\"a1\""));
        assert!(json.contains("\"currentLoad\":2"));
    }
}
