//! Task dispatcher for the Corral hub.
//!
//! Matches submitted tasks to eligible, healthy agents under a
//! configurable load-balancing strategy, tracks in-flight tasks and
//! deadlines, and recovers from agent loss by requeuing.

mod dispatcher;
mod strategy;
mod task;

pub use dispatcher::{
    DeliveryFuture, DispatcherConfig, ForwardFuture, Forwarder, Outbound, TaskDispatcher,
};
pub use strategy::Selector;
pub use task::TaskRecord;

/// Errors surfaced to requesters by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("task already exists: {0}")]
    TaskExists(String),

    #[error("dispatch queue at capacity")]
    QueueCapacityExceeded,

    #[error("no capable agent for task type: {0}")]
    NoCapableAgent(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),
}

/// Errors from cross-node task forwarding.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no peer can serve the task type")]
    NoCapablePeer,

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
}
