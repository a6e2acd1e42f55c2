//! Agent registry for the Corral hub.
//!
//! Authoritative in-memory table of known agents, their declared
//! capabilities, and liveness state, plus the per-agent circuit breaker
//! the dispatcher consults before routing a task.

mod breaker;
mod registry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitPhase};
pub use registry::{
    AgentRegistry, AgentSnapshot, RegisterOutcome, RegistryConfig, RegistryEvent,
};

/// Errors produced by the agent registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown task type in capabilities: {0}")]
    UnknownTaskType(String),

    #[error("agent_id must not be empty")]
    EmptyAgentId,
}
