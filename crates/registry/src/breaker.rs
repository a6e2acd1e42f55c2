//! Per-agent circuit breaker.
//!
//! Isolates a repeatedly failing agent from task selection without
//! removing its registration, so it can self-heal and rejoin after one
//! successful trial task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Initial cool-down before a half-open trial is allowed.
    pub cooldown: Duration,
    /// Cap for the exponentially growing cool-down.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// Observable phase of one agent's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitState {
    consecutive_failures: u32,
    phase: CircuitPhase,
    opened_at: Option<Instant>,
    /// Current cool-down; doubles on each re-open, capped.
    cooldown: Duration,
    /// Half-open admits exactly one trial task at a time.
    trial_in_flight: bool,
}

impl CircuitState {
    fn new(cooldown: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            phase: CircuitPhase::Closed,
            opened_at: None,
            cooldown,
            trial_in_flight: false,
        }
    }
}

/// Failure-rate tracker consulted before routing a task to an agent.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Records a successful task outcome for an agent.
    ///
    /// A success in `half_open` closes the circuit and resets the
    /// cool-down to its initial value.
    pub fn record_success(&self, agent_id: &str) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states
            .entry(agent_id.to_string())
            .or_insert_with(|| CircuitState::new(self.config.cooldown));

        if state.phase != CircuitPhase::Closed {
            tracing::info!(agent_id, "circuit closed");
        }
        state.phase = CircuitPhase::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.cooldown = self.config.cooldown;
        state.trial_in_flight = false;
    }

    /// Records a failed task outcome for an agent.
    ///
    /// Trips the circuit after `failure_threshold` consecutive failures;
    /// a failed half-open trial re-opens with a doubled cool-down.
    pub fn record_failure(&self, agent_id: &str) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states
            .entry(agent_id.to_string())
            .or_insert_with(|| CircuitState::new(self.config.cooldown));

        match state.phase {
            CircuitPhase::HalfOpen => {
                state.cooldown = (state.cooldown * 2).min(self.config.max_cooldown);
                state.phase = CircuitPhase::Open;
                state.opened_at = Some(Instant::now());
                state.trial_in_flight = false;
                metrics::counter!("corral_circuit_opened_total").increment(1);
                tracing::warn!(
                    agent_id,
                    cooldown_secs = state.cooldown.as_secs(),
                    "half-open trial failed, circuit re-opened"
                );
            }
            CircuitPhase::Open => {
                // Late failures from tasks dispatched before the trip.
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
            CircuitPhase::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.phase = CircuitPhase::Open;
                    state.opened_at = Some(Instant::now());
                    metrics::counter!("corral_circuit_opened_total").increment(1);
                    tracing::warn!(
                        agent_id,
                        failures = state.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
        }
    }

    /// Returns `true` while the agent must be excluded from selection.
    ///
    /// An elapsed cool-down transitions `open` to `half_open`, which no
    /// longer excludes the agent; trial admission is then gated by
    /// [`try_begin_trial`](Self::try_begin_trial).
    pub fn is_open(&self, agent_id: &str) -> bool {
        let Ok(mut states) = self.states.lock() else {
            return true;
        };
        let Some(state) = states.get_mut(agent_id) else {
            return false;
        };
        if state.phase != CircuitPhase::Open {
            return false;
        }
        let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        if elapsed >= state.cooldown {
            state.phase = CircuitPhase::HalfOpen;
            state.trial_in_flight = false;
            tracing::info!(agent_id, "circuit half-open");
            return false;
        }
        true
    }

    /// Reserves the dispatch slot for an agent.
    ///
    /// In `half_open` exactly one trial task may be in flight; other
    /// dispatch attempts are refused until the trial resolves. In
    /// `closed` this always succeeds.
    pub fn try_begin_trial(&self, agent_id: &str) -> bool {
        let Ok(mut states) = self.states.lock() else {
            return false;
        };
        let Some(state) = states.get_mut(agent_id) else {
            return true;
        };
        match state.phase {
            CircuitPhase::Closed => true,
            CircuitPhase::Open => false,
            CircuitPhase::HalfOpen => {
                if state.trial_in_flight {
                    false
                } else {
                    state.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Current phase for an agent (closed if never seen).
    pub fn phase(&self, agent_id: &str) -> CircuitPhase {
        self.states
            .lock()
            .map(|states| {
                states
                    .get(agent_id)
                    .map(|s| s.phase)
                    .unwrap_or(CircuitPhase::Closed)
            })
            .unwrap_or(CircuitPhase::Closed)
    }

    /// Drops state for an agent removed from the registry.
    pub fn forget(&self, agent_id: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(agent_id);
        }
    }
}
