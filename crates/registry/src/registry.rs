//! Agent table: registration, heartbeats, capability lookup, TTL sweep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corral_protocol::messages::{AgentRegisterRequest, PeerAgentSummary};
use corral_protocol::types::{AgentStatus, AgentSummary};

use crate::RegistryError;
use crate::breaker::{BreakerConfig, CircuitBreaker};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval at which agents are expected to heartbeat.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats tolerated before an agent is declared offline.
    pub missed_beat_tolerance: u32,
    /// Interval of the background liveness sweep.
    pub sweep_interval: Duration,
    /// How long an offline record is kept before removal.
    pub offline_grace: Duration,
    /// Closed set of task types agents may declare. Empty = open registry.
    pub known_task_types: Vec<String>,
    /// Circuit breaker tuning.
    pub breaker: BreakerConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            missed_beat_tolerance: 3,
            sweep_interval: Duration::from_secs(5),
            offline_grace: Duration::from_secs(300),
            known_task_types: Vec::new(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// TTL after which a silent agent is declared offline.
    pub fn ttl(&self) -> Duration {
        self.heartbeat_interval * self.missed_beat_tolerance
    }
}

/// One registered agent.
#[derive(Debug, Clone)]
struct AgentRecord {
    agent_id: String,
    agent_type: String,
    capabilities: HashSet<String>,
    status: AgentStatus,
    current_load: u32,
    weight: u32,
    connection: Option<Uuid>,
    last_heartbeat: Instant,
    registered_at: DateTime<Utc>,
    /// Set when the record went offline, for grace-period removal.
    offline_since: Option<Instant>,
}

/// Immutable view of an eligible agent handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub connection_id: Uuid,
    pub current_load: u32,
    pub weight: u32,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of a registration.
#[derive(Debug)]
pub struct RegisterOutcome {
    /// Connection displaced by a last-registration-wins takeover; the
    /// caller must close it.
    pub displaced_connection: Option<Uuid>,
}

/// Liveness notifications consumed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Agent registered (or re-registered) and is eligible for work.
    AgentOnline { agent_id: String },
    /// Agent went offline; its in-flight tasks must be requeued now.
    AgentOffline { agent_id: String },
}

/// Authoritative table of known agents and their liveness.
pub struct AgentRegistry {
    config: RegistryConfig,
    agents: RwLock<HashMap<String, AgentRecord>>,
    by_connection: RwLock<HashMap<Uuid, String>>,
    breaker: Arc<CircuitBreaker>,
    events_tx: mpsc::Sender<RegistryEvent>,
}

impl AgentRegistry {
    /// Creates a registry and the event stream its consumers listen on.
    pub fn new(config: RegistryConfig) -> (Arc<Self>, mpsc::Receiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        (
            Arc::new(Self {
                config,
                agents: RwLock::new(HashMap::new()),
                by_connection: RwLock::new(HashMap::new()),
                breaker,
                events_tx,
            }),
            events_rx,
        )
    }

    /// The circuit breaker shared with the dispatcher.
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Registers an agent, idempotently on its stable `agent_id`.
    ///
    /// If the id is already registered under a live connection, the new
    /// connection wins and the old one is returned for closing.
    pub async fn register(
        &self,
        connection_id: Uuid,
        req: &AgentRegisterRequest,
    ) -> Result<RegisterOutcome, RegistryError> {
        if req.agent_id.is_empty() {
            return Err(RegistryError::EmptyAgentId);
        }
        if !self.config.known_task_types.is_empty() {
            for cap in &req.capabilities {
                if !self.config.known_task_types.contains(cap) {
                    return Err(RegistryError::UnknownTaskType(cap.clone()));
                }
            }
        }

        let mut agents = self.agents.write().await;
        let mut by_conn = self.by_connection.write().await;

        let displaced = match agents.get(&req.agent_id) {
            Some(existing) => {
                let old = existing.connection.filter(|old| *old != connection_id);
                if let Some(old) = old {
                    tracing::warn!(
                        agent_id = %req.agent_id,
                        old_connection = %old,
                        new_connection = %connection_id,
                        "registration conflict, new connection wins"
                    );
                    by_conn.remove(&old);
                }
                old
            }
            None => None,
        };

        agents.insert(
            req.agent_id.clone(),
            AgentRecord {
                agent_id: req.agent_id.clone(),
                agent_type: req.agent_type.clone(),
                capabilities: req.capabilities.iter().cloned().collect(),
                status: AgentStatus::Online,
                current_load: 0,
                weight: req.weight.max(1),
                connection: Some(connection_id),
                last_heartbeat: Instant::now(),
                registered_at: Utc::now(),
                offline_since: None,
            },
        );
        by_conn.insert(connection_id, req.agent_id.clone());
        drop(by_conn);
        drop(agents);

        metrics::counter!("corral_agent_registrations_total").increment(1);
        tracing::info!(
            agent_id = %req.agent_id,
            agent_type = %req.agent_type,
            capabilities = ?req.capabilities,
            "agent registered"
        );

        let _ = self
            .events_tx
            .send(RegistryEvent::AgentOnline {
                agent_id: req.agent_id.clone(),
            })
            .await;

        Ok(RegisterOutcome {
            displaced_connection: displaced,
        })
    }

    /// Refreshes an agent's liveness from a heartbeat message.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        record.last_heartbeat = Instant::now();
        if record.status == AgentStatus::Degraded {
            record.status = AgentStatus::Online;
        }
        Ok(())
    }

    /// Returns agents eligible for a task type: online, capable, and not
    /// excluded by the circuit breaker.
    pub async fn lookup(&self, task_type: &str) -> Vec<AgentSnapshot> {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|r| r.status != AgentStatus::Offline)
            .filter(|r| r.capabilities.contains(task_type))
            .filter_map(|r| {
                let connection_id = r.connection?;
                if self.breaker.is_open(&r.agent_id) {
                    return None;
                }
                Some(AgentSnapshot {
                    agent_id: r.agent_id.clone(),
                    connection_id,
                    current_load: r.current_load,
                    weight: r.weight,
                    registered_at: r.registered_at,
                })
            })
            .collect()
    }

    /// Marks an agent offline and emits the requeue cascade event.
    pub async fn mark_offline(&self, agent_id: &str) {
        let went_offline = {
            let mut agents = self.agents.write().await;
            let mut by_conn = self.by_connection.write().await;
            match agents.get_mut(agent_id) {
                Some(record) if record.status != AgentStatus::Offline => {
                    record.status = AgentStatus::Offline;
                    record.offline_since = Some(Instant::now());
                    record.current_load = 0;
                    if let Some(conn) = record.connection.take() {
                        by_conn.remove(&conn);
                    }
                    true
                }
                _ => false,
            }
        };

        if went_offline {
            tracing::warn!(agent_id, "agent offline");
            metrics::counter!("corral_agents_offline_total").increment(1);
            let _ = self
                .events_tx
                .send(RegistryEvent::AgentOffline {
                    agent_id: agent_id.to_string(),
                })
                .await;
        }
    }

    /// Resolves the agent registered over a connection, if any.
    pub async fn agent_for_connection(&self, connection_id: Uuid) -> Option<String> {
        self.by_connection.read().await.get(&connection_id).cloned()
    }

    /// Releases any agent registration bound to a closed connection.
    ///
    /// Returns the agent id that went offline, if the connection was an
    /// agent's.
    pub async fn connection_closed(&self, connection_id: Uuid) -> Option<String> {
        let agent_id = self.by_connection.read().await.get(&connection_id).cloned();
        if let Some(ref id) = agent_id {
            self.mark_offline(id).await;
        }
        agent_id
    }

    /// Increments an agent's in-flight task count.
    pub async fn inc_load(&self, agent_id: &str) {
        if let Some(r) = self.agents.write().await.get_mut(agent_id) {
            r.current_load = r.current_load.saturating_add(1);
        }
    }

    /// Decrements an agent's in-flight task count.
    pub async fn dec_load(&self, agent_id: &str) {
        if let Some(r) = self.agents.write().await.get_mut(agent_id) {
            r.current_load = r.current_load.saturating_sub(1);
        }
    }

    /// Current in-flight count for an agent (0 if unknown).
    pub async fn load_of(&self, agent_id: &str) -> u32 {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|r| r.current_load)
            .unwrap_or(0)
    }

    /// Number of agents currently online or degraded.
    pub async fn online_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|r| r.status != AgentStatus::Offline)
            .count()
    }

    /// Health-surface view of every known agent.
    pub async fn snapshot(&self) -> Vec<AgentSummary> {
        self.agents
            .read()
            .await
            .values()
            .map(|r| AgentSummary {
                agent_id: r.agent_id.clone(),
                agent_type: r.agent_type.clone(),
                status: r.status,
                capabilities: r.capabilities.iter().cloned().collect(),
                current_load: r.current_load,
                weight: r.weight,
            })
            .collect()
    }

    /// Summary of live agents published to cluster peers.
    pub async fn peer_summary(&self) -> Vec<PeerAgentSummary> {
        self.agents
            .read()
            .await
            .values()
            .filter(|r| r.status != AgentStatus::Offline)
            .map(|r| PeerAgentSummary {
                agent_id: r.agent_id.clone(),
                capabilities: r.capabilities.iter().cloned().collect(),
            })
            .collect()
    }

    /// One liveness sweep pass: TTL expiry and grace-period removal.
    ///
    /// Exposed for tests; [`run_sweeper`](Self::run_sweeper) calls it on
    /// a fixed interval.
    pub async fn sweep(&self) {
        let ttl = self.config.ttl();
        let mut expired = Vec::new();
        let mut removed = Vec::new();

        {
            let mut agents = self.agents.write().await;
            for record in agents.values_mut() {
                match record.status {
                    AgentStatus::Offline => {}
                    _ => {
                        let silence = record.last_heartbeat.elapsed();
                        if silence >= ttl {
                            expired.push(record.agent_id.clone());
                        } else if silence >= self.config.heartbeat_interval
                            && record.status == AgentStatus::Online
                        {
                            record.status = AgentStatus::Degraded;
                        }
                    }
                }
            }
            agents.retain(|_, r| match (r.status, r.offline_since) {
                (AgentStatus::Offline, Some(since)) => {
                    if since.elapsed() >= self.config.offline_grace {
                        removed.push(r.agent_id.clone());
                        false
                    } else {
                        true
                    }
                }
                _ => true,
            });
        }

        for agent_id in &removed {
            self.breaker.forget(agent_id);
            tracing::debug!(agent_id, "offline agent removed after grace period");
        }
        for agent_id in expired {
            self.mark_offline(&agent_id).await;
        }
    }

    /// Runs the liveness sweeper until cancellation.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep().await;
                    metrics::gauge!("corral_agents_online")
                        .set(self.online_count().await as f64);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_req(agent_id: &str, caps: &[&str]) -> AgentRegisterRequest {
        AgentRegisterRequest {
            agent_id: agent_id.into(),
            agent_type: "worker".into(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            weight: 1,
        }
    }

    fn test_config() -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_millis(50),
            missed_beat_tolerance: 3,
            sweep_interval: Duration::from_millis(20),
            offline_grace: Duration::from_secs(60),
            known_task_types: Vec::new(),
            breaker: BreakerConfig::default(),
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let (registry, _rx) = AgentRegistry::new(test_config());
        let conn = Uuid::new_v4();
        registry
            .register(conn, &register_req("a1", &["echo", "search"]))
            .await
            .unwrap();

        let eligible = registry.lookup("echo").await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].agent_id, "a1");
        assert_eq!(eligible[0].connection_id, conn);

        assert!(registry.lookup("translate").await.is_empty());
    }

    #[tokio::test]
    async fn register_validates_capabilities() {
        let mut config = test_config();
        config.known_task_types = vec!["echo".into()];
        let (registry, _rx) = AgentRegistry::new(config);

        let err = registry
            .register(Uuid::new_v4(), &register_req("a1", &["mystery"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTaskType(t) if t == "mystery"));

        registry
            .register(Uuid::new_v4(), &register_req("a2", &["echo"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn register_rejects_empty_id() {
        let (registry, _rx) = AgentRegistry::new(test_config());
        let err = registry
            .register(Uuid::new_v4(), &register_req("", &["echo"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::EmptyAgentId));
    }

    #[tokio::test]
    async fn reregistration_displaces_old_connection() {
        let (registry, mut rx) = AgentRegistry::new(test_config());
        let conn1 = Uuid::new_v4();
        let conn2 = Uuid::new_v4();

        let outcome = registry
            .register(conn1, &register_req("a1", &["echo"]))
            .await
            .unwrap();
        assert!(outcome.displaced_connection.is_none());

        let outcome = registry
            .register(conn2, &register_req("a1", &["echo"]))
            .await
            .unwrap();
        assert_eq!(outcome.displaced_connection, Some(conn1));

        // Lookup must point at the new connection.
        let eligible = registry.lookup("echo").await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].connection_id, conn2);

        // Two online events, one per registration.
        assert_eq!(
            rx.recv().await,
            Some(RegistryEvent::AgentOnline {
                agent_id: "a1".into()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(RegistryEvent::AgentOnline {
                agent_id: "a1".into()
            })
        );
    }

    #[tokio::test]
    async fn connection_closed_cascades_offline() {
        let (registry, mut rx) = AgentRegistry::new(test_config());
        let conn = Uuid::new_v4();
        registry
            .register(conn, &register_req("a1", &["echo"]))
            .await
            .unwrap();
        let _ = rx.recv().await; // online event

        let agent = registry.connection_closed(conn).await;
        assert_eq!(agent.as_deref(), Some("a1"));
        assert!(registry.lookup("echo").await.is_empty());
        assert_eq!(
            rx.recv().await,
            Some(RegistryEvent::AgentOffline {
                agent_id: "a1".into()
            })
        );
    }

    #[tokio::test]
    async fn unknown_connection_close_is_noop() {
        let (registry, _rx) = AgentRegistry::new(test_config());
        assert!(registry.connection_closed(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_fails() {
        let (registry, _rx) = AgentRegistry::new(test_config());
        assert!(registry.heartbeat("ghost").await.is_err());
    }

    #[tokio::test]
    async fn sweep_marks_silent_agent_offline() {
        let (registry, mut rx) = AgentRegistry::new(test_config());
        registry
            .register(Uuid::new_v4(), &register_req("a1", &["echo"]))
            .await
            .unwrap();
        let _ = rx.recv().await;

        // TTL = 150ms; wait past it, then sweep.
        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.sweep().await;

        assert!(registry.lookup("echo").await.is_empty());
        assert_eq!(registry.online_count().await, 0);
        assert_eq!(
            rx.recv().await,
            Some(RegistryEvent::AgentOffline {
                agent_id: "a1".into()
            })
        );
    }

    #[tokio::test]
    async fn heartbeat_keeps_agent_online_through_sweeps() {
        let (registry, _rx) = AgentRegistry::new(test_config());
        registry
            .register(Uuid::new_v4(), &register_req("a1", &["echo"]))
            .await
            .unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            registry.heartbeat("a1").await.unwrap();
            registry.sweep().await;
            assert_eq!(registry.lookup("echo").await.len(), 1);
        }
    }

    #[tokio::test]
    async fn sweep_degrades_before_expiring() {
        let (registry, _rx) = AgentRegistry::new(test_config());
        registry
            .register(Uuid::new_v4(), &register_req("a1", &["echo"]))
            .await
            .unwrap();

        // One missed interval (50ms) but within TTL (150ms).
        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.sweep().await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].status, AgentStatus::Degraded);
        // Degraded agents remain eligible.
        assert_eq!(registry.lookup("echo").await.len(), 1);

        // A heartbeat restores online.
        registry.heartbeat("a1").await.unwrap();
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn offline_record_removed_after_grace() {
        let mut config = test_config();
        config.offline_grace = Duration::from_millis(30);
        let (registry, _rx) = AgentRegistry::new(config);
        registry
            .register(Uuid::new_v4(), &register_req("a1", &["echo"]))
            .await
            .unwrap();

        registry.mark_offline("a1").await;
        assert_eq!(registry.snapshot().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.sweep().await;
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn open_circuit_excluded_from_lookup() {
        let mut config = test_config();
        config.breaker.failure_threshold = 1;
        let (registry, _rx) = AgentRegistry::new(config);
        registry
            .register(Uuid::new_v4(), &register_req("a1", &["echo"]))
            .await
            .unwrap();

        registry.breaker().record_failure("a1");
        assert!(registry.lookup("echo").await.is_empty());

        registry.breaker().record_success("a1");
        assert_eq!(registry.lookup("echo").await.len(), 1);
    }

    #[tokio::test]
    async fn load_tracking() {
        let (registry, _rx) = AgentRegistry::new(test_config());
        registry
            .register(Uuid::new_v4(), &register_req("a1", &["echo"]))
            .await
            .unwrap();

        registry.inc_load("a1").await;
        registry.inc_load("a1").await;
        assert_eq!(registry.load_of("a1").await, 2);
        registry.dec_load("a1").await;
        assert_eq!(registry.load_of("a1").await, 1);
        // Never underflows.
        registry.dec_load("a1").await;
        registry.dec_load("a1").await;
        assert_eq!(registry.load_of("a1").await, 0);
    }
}
