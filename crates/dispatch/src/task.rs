//! Task bookkeeping.

use std::time::Instant;

use corral_protocol::types::TaskState;
use uuid::Uuid;

/// One task awaiting or undergoing execution.
///
/// State transitions happen only inside the dispatcher:
/// `queued -> dispatched -> {completed, failed, timed_out}`, with
/// `dispatched -> queued` on requeue.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: String,
    pub payload: Box<serde_json::value::RawValue>,
    /// Connection that submitted the task; `None` for tasks that arrived
    /// over a peer link whose origin hub does the client-facing work.
    pub requester: Option<Uuid>,
    pub assigned_agent: Option<String>,
    /// Connection the task was delegated over, for cancel notices.
    pub assigned_connection: Option<Uuid>,
    /// Set while a peer hub is executing the task on our behalf.
    pub remote: bool,
    pub state: TaskState,
    pub created_at: Instant,
    pub dispatched_at: Option<Instant>,
    pub deadline: Instant,
    pub retry_count: u32,
}

impl TaskRecord {
    /// Returns `true` when a dispatched task has outlived its deadline.
    pub fn past_deadline(&self, now: Instant) -> bool {
        self.state == TaskState::Dispatched && now >= self.deadline
    }
}
