//! Task dispatch: queueing, agent selection, delivery, timeouts, retry.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corral_protocol::constants::{ERR_CODE_CANCELLED, ERR_CODE_DISPATCH_TIMEOUT, MessageType};
use corral_protocol::envelope::Message;
use corral_protocol::messages::{TaskDelegateRequest, TaskResultPayload, TaskSubmitRequest};
use corral_protocol::types::{LoadBalanceStrategy, TaskOutcome, TaskState};
use corral_registry::{AgentRegistry, CircuitBreaker};

use crate::strategy::Selector;
use crate::task::TaskRecord;
use crate::{DispatchError, ForwardError};

/// A boxed future returned by [`Outbound::deliver`].
pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ()>> + Send + 'a>>;

/// Transport abstraction the dispatcher delivers messages through.
///
/// Implemented over the server's connection table; delivery must never
/// block (bounded queues underneath).
pub trait Outbound: Send + Sync + 'static {
    fn deliver(&self, connection_id: Uuid, msg: Message) -> DeliveryFuture<'_>;
}

/// A boxed future returned by [`Forwarder::forward`].
pub type ForwardFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TaskResultPayload, ForwardError>> + Send + 'a>>;

/// Cross-node escape hatch consulted when no local agent can serve a
/// task. Implemented by the cluster coordinator.
pub trait Forwarder: Send + Sync + 'static {
    fn forward(&self, task: TaskSubmitRequest) -> ForwardFuture<'_>;
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum queued (not yet dispatched) tasks.
    pub queue_capacity: usize,
    /// Requeue attempts before a task is declared timed out.
    pub max_retries: u32,
    /// Deadline applied when a submission carries no timeout.
    pub default_timeout: Duration,
    /// How long terminal task ids are remembered (duplicate detection).
    pub retention: Duration,
    /// Interval of the timeout sweep.
    pub sweep_interval: Duration,
    pub strategy: LoadBalanceStrategy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_retries: 2,
            default_timeout: Duration::from_secs(60),
            retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(2),
            strategy: LoadBalanceStrategy::default(),
        }
    }
}

#[derive(Default)]
struct DispatchState {
    /// Live (queued or dispatched) tasks.
    tasks: HashMap<String, TaskRecord>,
    /// Ids of queued tasks, in arrival order.
    queue: VecDeque<String>,
    /// Terminal task ids and when they finished, kept for the retention
    /// window so duplicate submissions are caught.
    archive: HashMap<String, Instant>,
}

/// Matches incoming tasks to eligible, healthy agents.
///
/// All task state lives behind one async mutex held across each
/// operation, which serializes state transitions and makes the
/// no-double-dispatch invariant structural.
pub struct TaskDispatcher {
    config: DispatcherConfig,
    registry: Arc<AgentRegistry>,
    breaker: Arc<CircuitBreaker>,
    selector: Selector,
    outbound: Arc<dyn Outbound>,
    forwarder: OnceLock<Arc<dyn Forwarder>>,
    state: Mutex<DispatchState>,
}

impl TaskDispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<AgentRegistry>,
        outbound: Arc<dyn Outbound>,
    ) -> Arc<Self> {
        let breaker = registry.breaker();
        let selector = Selector::new(config.strategy);
        Arc::new(Self {
            config,
            registry,
            breaker,
            selector,
            outbound,
            forwarder: OnceLock::new(),
            state: Mutex::new(DispatchState::default()),
        })
    }

    /// Installs the cluster forwarder. May only be called once, before
    /// traffic starts.
    pub fn set_forwarder(&self, forwarder: Arc<dyn Forwarder>) {
        let _ = self.forwarder.set(forwarder);
    }

    /// Number of live (queued + dispatched) tasks.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    /// Number of queued tasks awaiting an agent.
    pub async fn queued_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// State of a task, if the dispatcher still remembers it.
    pub async fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.state.lock().await.tasks.get(task_id).map(|t| t.state)
    }

    /// Accepts a task for dispatch.
    ///
    /// Fails synchronously on duplicate ids and on a full queue (no
    /// [`TaskRecord`] is created in either case). A forwarded task that
    /// finds no local eligible agent fails with `NoCapableAgent` instead
    /// of queueing, so the origin hub can surface the error.
    pub async fn submit(
        self: &Arc<Self>,
        req: TaskSubmitRequest,
        requester: Option<Uuid>,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;

        if state.tasks.contains_key(&req.task_id) || state.archive.contains_key(&req.task_id) {
            return Err(DispatchError::TaskExists(req.task_id));
        }
        if state.queue.len() >= self.config.queue_capacity {
            metrics::counter!("corral_tasks_rejected_total", "reason" => "queue_capacity")
                .increment(1);
            return Err(DispatchError::QueueCapacityExceeded);
        }

        let now = Instant::now();
        let timeout = req
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_timeout);
        let record = TaskRecord {
            task_id: req.task_id.clone(),
            task_type: req.task_type.clone(),
            payload: req.payload.clone(),
            requester,
            assigned_agent: None,
            assigned_connection: None,
            remote: false,
            state: TaskState::Queued,
            created_at: now,
            dispatched_at: None,
            deadline: now + timeout,
            retry_count: 0,
        };
        let task_id = record.task_id.clone();
        state.tasks.insert(task_id.clone(), record);
        state.queue.push_back(task_id.clone());
        metrics::counter!("corral_tasks_submitted_total").increment(1);
        tracing::debug!(task_id = %task_id, task_type = %req.task_type, "task accepted");

        self.try_dispatch_queued(&mut state).await;

        let still_queued = state
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.state == TaskState::Queued);
        if still_queued && req.forwarded {
            // Single-hop rule: a forwarded task is never parked remotely.
            state.queue.retain(|id| id != &task_id);
            state.tasks.remove(&task_id);
            return Err(DispatchError::NoCapableAgent(req.task_type));
        }
        drop(state);

        if still_queued && !req.forwarded {
            self.maybe_forward(&task_id).await;
        }
        Ok(())
    }

    /// Handles a `task_result` from an agent.
    ///
    /// The reporting agent must be the current assignee; stale reports
    /// (from a requeued or cancelled task) are dropped.
    pub async fn on_result(
        self: &Arc<Self>,
        reporting_agent: &str,
        result: TaskResultPayload,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;

        let record = match state.tasks.get_mut(&result.task_id) {
            Some(r) => r,
            None => {
                tracing::warn!(
                    task_id = %result.task_id,
                    agent_id = reporting_agent,
                    "result for unknown task, dropping"
                );
                return Err(DispatchError::UnknownTask(result.task_id));
            }
        };
        if record.state != TaskState::Dispatched
            || record.assigned_agent.as_deref() != Some(reporting_agent)
        {
            tracing::warn!(
                task_id = %result.task_id,
                agent_id = reporting_agent,
                state = ?record.state,
                "stale result, dropping"
            );
            return Err(DispatchError::UnknownTask(result.task_id));
        }

        let latency = record
            .dispatched_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let requester = record.requester;
        let terminal = match result.status {
            TaskOutcome::Completed => TaskState::Completed,
            TaskOutcome::Error => TaskState::Failed,
        };
        self.finish_task(&mut state, &result.task_id, terminal);

        drop(state);

        self.registry.dec_load(reporting_agent).await;
        match result.status {
            TaskOutcome::Completed => {
                self.breaker.record_success(reporting_agent);
                self.selector.record_latency(reporting_agent, latency);
                metrics::counter!("corral_tasks_completed_total").increment(1);
            }
            TaskOutcome::Error => {
                self.breaker.record_failure(reporting_agent);
                metrics::counter!("corral_tasks_failed_total").increment(1);
            }
        }
        metrics::histogram!("corral_task_latency_seconds").record(latency.as_secs_f64());
        tracing::info!(
            task_id = %result.task_id,
            agent_id = reporting_agent,
            status = ?result.status,
            latency_ms = latency.as_millis() as u64,
            "task finished"
        );

        // Forward the result to the requester with the payload untouched.
        if let Some(conn) = requester {
            if let Ok(msg) = Message::new(&result.task_id, MessageType::TaskComplete, Some(&result))
            {
                let _ = self.outbound.deliver(conn, msg).await;
            }
        }

        // The agent freed a slot; drain the queue.
        let mut state = self.state.lock().await;
        self.try_dispatch_queued(&mut state).await;
        Ok(())
    }

    /// Cancels a queued or dispatched task.
    ///
    /// A dispatched task gets a best-effort cancel notice to its agent;
    /// the hub does not wait for acknowledgment.
    pub async fn cancel(self: &Arc<Self>, task_id: &str) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;

        let record = state
            .tasks
            .get(task_id)
            .ok_or_else(|| DispatchError::UnknownTask(task_id.to_string()))?
            .clone();

        if record.state == TaskState::Dispatched {
            if let (Some(agent), Some(conn)) = (&record.assigned_agent, record.assigned_connection)
            {
                let notice = corral_protocol::messages::TaskCancelRequest {
                    task_id: task_id.to_string(),
                };
                if let Ok(msg) = Message::new(task_id, MessageType::TaskCancel, Some(&notice)) {
                    let _ = self.outbound.deliver(conn, msg).await;
                }
                self.registry.dec_load(agent).await;
            }
        }
        state.queue.retain(|id| id != task_id);
        self.finish_task(&mut state, task_id, TaskState::Failed);
        drop(state);

        metrics::counter!("corral_tasks_cancelled_total").increment(1);
        tracing::info!(task_id, "task cancelled");

        if let Some(conn) = record.requester {
            let _ = self
                .outbound
                .deliver(conn, Message::error(task_id, ERR_CODE_CANCELLED, "cancelled"))
                .await;
        }
        Ok(())
    }

    /// Requeues every task held by an agent that went offline.
    ///
    /// Called from the registry's offline cascade, immediately, without
    /// waiting for the timeout sweep.
    pub async fn on_agent_offline(self: &Arc<Self>, agent_id: &str) {
        let mut state = self.state.lock().await;

        let held: Vec<String> = state
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Dispatched && t.assigned_agent.as_deref() == Some(agent_id)
            })
            .map(|t| t.task_id.clone())
            .collect();

        for task_id in held {
            self.requeue_or_fail(&mut state, &task_id, "agent unreachable")
                .await;
        }
        self.selector.forget(agent_id);
        self.try_dispatch_queued(&mut state).await;
    }

    /// Drains the queue after an agent (re)joined.
    pub async fn on_agent_online(self: &Arc<Self>, _agent_id: &str) {
        let mut state = self.state.lock().await;
        self.try_dispatch_queued(&mut state).await;
    }

    /// One timeout sweep pass: expired dispatched tasks are requeued or
    /// timed out, the archive is pruned, and the queue is re-drained.
    ///
    /// Exposed for tests; [`run_timeout_sweeper`](Self::run_timeout_sweeper)
    /// calls it on a fixed interval.
    pub async fn sweep(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.past_deadline(now))
            .map(|t| t.task_id.clone())
            .collect();

        for task_id in expired {
            // An unresponsive assignee counts against its circuit.
            if let Some(agent) = state
                .tasks
                .get(&task_id)
                .and_then(|t| t.assigned_agent.clone())
            {
                self.breaker.record_failure(&agent);
                self.registry.dec_load(&agent).await;
            }
            self.requeue_or_fail(&mut state, &task_id, "deadline exceeded")
                .await;
        }

        let retention = self.config.retention;
        state.archive.retain(|_, finished| finished.elapsed() < retention);

        self.try_dispatch_queued(&mut state).await;
        metrics::gauge!("corral_tasks_queued").set(state.queue.len() as f64);
        metrics::gauge!("corral_tasks_pending").set(state.tasks.len() as f64);
    }

    /// Runs the timeout sweeper until cancellation.
    pub async fn run_timeout_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.sweep().await,
            }
        }
    }

    // -----------------------------------------------------------------
    // Internals (all called with the state lock held)
    // -----------------------------------------------------------------

    /// Attempts to dispatch every queued task, in arrival order.
    async fn try_dispatch_queued(self: &Arc<Self>, state: &mut DispatchState) {
        let queued: Vec<String> = state.queue.iter().cloned().collect();
        for task_id in queued {
            self.try_dispatch_one(state, &task_id).await;
        }
    }

    /// Attempts to dispatch a single queued task. Leaves it queued when
    /// no eligible agent accepts delivery.
    async fn try_dispatch_one(self: &Arc<Self>, state: &mut DispatchState, task_id: &str) -> bool {
        let (task_type, payload) = match state.tasks.get(task_id) {
            Some(t) if t.state == TaskState::Queued => (t.task_type.clone(), t.payload.clone()),
            _ => return false,
        };

        let mut pool = self.registry.lookup(&task_type).await;
        loop {
            let Some(chosen) = self.selector.select(&pool) else {
                return false;
            };
            // Half-open circuits admit one trial task at a time.
            if !self.breaker.try_begin_trial(&chosen.agent_id) {
                pool.retain(|a| a.agent_id != chosen.agent_id);
                continue;
            }

            let delegate = TaskDelegateRequest {
                task_id: task_id.to_string(),
                task_type: task_type.clone(),
                payload: payload.clone(),
            };
            let msg = match Message::new(task_id, MessageType::TaskDelegate, Some(&delegate)) {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(task_id, "failed to encode delegate message: {e}");
                    return false;
                }
            };

            match self.outbound.deliver(chosen.connection_id, msg).await {
                Ok(()) => {
                    if let Some(record) = state.tasks.get_mut(task_id) {
                        record.state = TaskState::Dispatched;
                        record.assigned_agent = Some(chosen.agent_id.clone());
                        record.assigned_connection = Some(chosen.connection_id);
                        record.dispatched_at = Some(Instant::now());
                    }
                    state.queue.retain(|id| id != task_id);
                    self.registry.inc_load(&chosen.agent_id).await;
                    metrics::counter!("corral_tasks_dispatched_total").increment(1);
                    tracing::debug!(
                        task_id,
                        agent_id = %chosen.agent_id,
                        "task dispatched"
                    );
                    return true;
                }
                Err(()) => {
                    // Connection died between lookup and delivery; the
                    // disconnect cascade will mark the agent offline.
                    tracing::warn!(
                        task_id,
                        agent_id = %chosen.agent_id,
                        "delivery failed, trying next eligible agent"
                    );
                    self.breaker.record_failure(&chosen.agent_id);
                    pool.retain(|a| a.agent_id != chosen.agent_id);
                }
            }
        }
    }

    /// Requeues a dispatched task, or finishes it once retries exhaust.
    async fn requeue_or_fail(
        self: &Arc<Self>,
        state: &mut DispatchState,
        task_id: &str,
        reason: &str,
    ) {
        let Some(record) = state.tasks.get_mut(task_id) else {
            return;
        };
        let requester = record.requester;

        if record.retry_count < self.config.max_retries {
            record.retry_count += 1;
            record.state = TaskState::Queued;
            record.assigned_agent = None;
            record.assigned_connection = None;
            record.remote = false;
            record.dispatched_at = None;
            state.queue.push_back(task_id.to_string());
            metrics::counter!("corral_tasks_requeued_total").increment(1);
            tracing::info!(task_id, reason, "task requeued");
        } else {
            self.finish_task(state, task_id, TaskState::TimedOut);
            metrics::counter!("corral_tasks_timed_out_total").increment(1);
            tracing::warn!(task_id, reason, "task timed out, retries exhausted");
            if let Some(conn) = requester {
                let _ = self
                    .outbound
                    .deliver(
                        conn,
                        Message::error(
                            task_id,
                            ERR_CODE_DISPATCH_TIMEOUT,
                            format!("task timed out: {reason}"),
                        ),
                    )
                    .await;
            }
        }
    }

    /// Moves a task to a terminal state and into the retention archive.
    fn finish_task(&self, state: &mut DispatchState, task_id: &str, terminal: TaskState) {
        debug_assert!(terminal.is_terminal());
        if let Some(mut record) = state.tasks.remove(task_id) {
            record.state = terminal;
            state.archive.insert(task_id.to_string(), Instant::now());
        }
        state.queue.retain(|id| id != task_id);
    }

    // -----------------------------------------------------------------
    // Cluster forwarding
    // -----------------------------------------------------------------

    /// Hands a queued task to the cluster coordinator when no local
    /// agent can serve it. Single hop: the submission we send carries
    /// the forwarded marker.
    async fn maybe_forward(self: &Arc<Self>, task_id: &str) {
        let Some(forwarder) = self.forwarder.get() else {
            return;
        };

        let req = {
            let mut state = self.state.lock().await;
            let Some(record) = state.tasks.get_mut(task_id) else {
                return;
            };
            if record.state != TaskState::Queued {
                return;
            }
            let remaining = record.deadline.saturating_duration_since(Instant::now());
            record.state = TaskState::Dispatched;
            record.remote = true;
            record.dispatched_at = Some(Instant::now());
            let fwd = TaskSubmitRequest {
                task_id: record.task_id.clone(),
                task_type: record.task_type.clone(),
                payload: record.payload.clone(),
                timeout_secs: Some(remaining.as_secs().max(1)),
                forwarded: true,
            };
            state.queue.retain(|id| id != task_id);
            fwd
        };

        let dispatcher = Arc::clone(self);
        let forwarder = Arc::clone(forwarder);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let result = forwarder.forward(req).await;
            dispatcher.complete_remote(&task_id, result).await;
        });
    }

    /// Applies the outcome of a forwarded task.
    async fn complete_remote(
        self: &Arc<Self>,
        task_id: &str,
        result: Result<TaskResultPayload, ForwardError>,
    ) {
        let mut state = self.state.lock().await;
        let Some(record) = state.tasks.get(task_id) else {
            return; // Cancelled or already requeued by the sweep.
        };
        if record.state != TaskState::Dispatched || !record.remote {
            return;
        }
        let requester = record.requester;

        match result {
            Ok(payload) => {
                let terminal = match payload.status {
                    TaskOutcome::Completed => TaskState::Completed,
                    TaskOutcome::Error => TaskState::Failed,
                };
                self.finish_task(&mut state, task_id, terminal);
                metrics::counter!("corral_tasks_forwarded_total", "outcome" => "completed")
                    .increment(1);
                tracing::info!(task_id, status = ?payload.status, "forwarded task finished");
                drop(state);
                if let Some(conn) = requester {
                    if let Ok(msg) =
                        Message::new(task_id, MessageType::TaskComplete, Some(&payload))
                    {
                        let _ = self.outbound.deliver(conn, msg).await;
                    }
                }
            }
            Err(e) => {
                // The cluster could not serve it; back to the local
                // queue to wait for an agent or the deadline.
                tracing::info!(task_id, "forward failed, requeueing locally: {e}");
                metrics::counter!("corral_tasks_forwarded_total", "outcome" => "failed")
                    .increment(1);
                if let Some(record) = state.tasks.get_mut(task_id) {
                    record.state = TaskState::Queued;
                    record.remote = false;
                    record.dispatched_at = None;
                    state.queue.push_back(task_id.to_string());
                }
                self.try_dispatch_queued(&mut state).await;
            }
        }
    }
}
