//! Agent selection strategies.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;

use corral_protocol::types::LoadBalanceStrategy;
use corral_registry::AgentSnapshot;

/// Decay constant for the adaptive strategy's latency average.
const EWMA_ALPHA: f64 = 0.2;

/// Picks one agent from an eligible list according to the configured
/// load-balancing strategy.
///
/// The eligible list is sorted by registration time before selection so
/// the round-robin cursor walks a stable order regardless of how the
/// registry iterates its table.
pub struct Selector {
    strategy: LoadBalanceStrategy,
    rr_cursor: AtomicUsize,
    /// EWMA of task latency per agent, in milliseconds.
    latency: Mutex<HashMap<String, f64>>,
}

impl Selector {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            rr_cursor: AtomicUsize::new(0),
            latency: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    /// Selects one agent from the eligible list.
    ///
    /// Returns `None` only for an empty list.
    pub fn select(&self, eligible: &[AgentSnapshot]) -> Option<AgentSnapshot> {
        if eligible.is_empty() {
            return None;
        }
        let mut sorted: Vec<&AgentSnapshot> = eligible.iter().collect();
        sorted.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let chosen = match self.strategy {
            LoadBalanceStrategy::RoundRobin => {
                let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
                sorted[cursor % sorted.len()]
            }
            LoadBalanceStrategy::Weighted => self.select_weighted(&sorted),
            LoadBalanceStrategy::LeastConnections => Self::select_least_connections(&sorted),
            LoadBalanceStrategy::Adaptive => self.select_adaptive(&sorted),
        };
        Some(chosen.clone())
    }

    /// Records a completed task's latency for the adaptive strategy.
    pub fn record_latency(&self, agent_id: &str, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        if let Ok(mut map) = self.latency.lock() {
            let avg = map.entry(agent_id.to_string()).or_insert(sample);
            *avg = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * *avg;
        }
    }

    /// Drops latency history for an agent removed from the pool.
    pub fn forget(&self, agent_id: &str) {
        if let Ok(mut map) = self.latency.lock() {
            map.remove(agent_id);
        }
    }

    fn select_weighted<'a>(&self, sorted: &[&'a AgentSnapshot]) -> &'a AgentSnapshot {
        let total: u64 = sorted.iter().map(|a| u64::from(a.weight.max(1))).sum();
        let mut draw = rand::thread_rng().gen_range(0..total);
        for agent in sorted {
            let w = u64::from(agent.weight.max(1));
            if draw < w {
                return agent;
            }
            draw -= w;
        }
        // Unreachable with a correct total; fall back to the last entry.
        sorted[sorted.len() - 1]
    }

    fn select_least_connections<'a>(sorted: &[&'a AgentSnapshot]) -> &'a AgentSnapshot {
        // Ties break toward the earliest registration, which is the sort
        // order already.
        sorted
            .iter()
            .min_by_key(|a| a.current_load)
            .copied()
            .unwrap_or(sorted[0])
    }

    fn select_adaptive<'a>(&self, sorted: &[&'a AgentSnapshot]) -> &'a AgentSnapshot {
        let Ok(map) = self.latency.lock() else {
            return Self::select_least_connections(sorted);
        };
        if map.is_empty() {
            return Self::select_least_connections(sorted);
        }
        // Agents without history sort first (0.0) so new arrivals get
        // traffic and build an average.
        sorted
            .iter()
            .min_by(|a, b| {
                let la = map.get(&a.agent_id).copied().unwrap_or(0.0);
                let lb = map.get(&b.agent_id).copied().unwrap_or(0.0);
                la.total_cmp(&lb)
            })
            .copied()
            .unwrap_or(sorted[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn snapshot(agent_id: &str, load: u32, weight: u32, reg_offset_secs: i64) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: agent_id.into(),
            connection_id: Uuid::new_v4(),
            current_load: load,
            weight,
            registered_at: Utc.timestamp_opt(1_700_000_000 + reg_offset_secs, 0).unwrap(),
        }
    }

    #[test]
    fn empty_list_selects_nothing() {
        let selector = Selector::new(LoadBalanceStrategy::RoundRobin);
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn round_robin_distributes_evenly() {
        let selector = Selector::new(LoadBalanceStrategy::RoundRobin);
        let eligible = vec![
            snapshot("a1", 0, 1, 0),
            snapshot("a2", 0, 1, 1),
            snapshot("a3", 0, 1, 2),
        ];

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..9 {
            let chosen = selector.select(&eligible).unwrap();
            *counts.entry(chosen.agent_id).or_default() += 1;
        }
        assert_eq!(counts.get("a1"), Some(&3));
        assert_eq!(counts.get("a2"), Some(&3));
        assert_eq!(counts.get("a3"), Some(&3));
    }

    #[test]
    fn round_robin_order_independent_of_input_order() {
        let selector = Selector::new(LoadBalanceStrategy::RoundRobin);
        let a = snapshot("a1", 0, 1, 0);
        let b = snapshot("a2", 0, 1, 1);

        // Same pool presented in different orders must still alternate.
        let first = selector.select(&[a.clone(), b.clone()]).unwrap();
        let second = selector.select(&[b.clone(), a.clone()]).unwrap();
        assert_ne!(first.agent_id, second.agent_id);
    }

    #[test]
    fn weighted_converges_to_weight_ratio() {
        let selector = Selector::new(LoadBalanceStrategy::Weighted);
        let eligible = vec![snapshot("light", 0, 1, 0), snapshot("heavy", 0, 3, 1)];

        let mut heavy = 0u32;
        let draws = 10_000;
        for _ in 0..draws {
            if selector.select(&eligible).unwrap().agent_id == "heavy" {
                heavy += 1;
            }
        }
        // Expected 75%; allow a generous band for sampling noise.
        let share = f64::from(heavy) / f64::from(draws);
        assert!((0.70..0.80).contains(&share), "heavy share was {share}");
    }

    #[test]
    fn least_connections_picks_min_load() {
        let selector = Selector::new(LoadBalanceStrategy::LeastConnections);
        let eligible = vec![
            snapshot("busy", 5, 1, 0),
            snapshot("idle", 0, 1, 1),
            snapshot("mid", 2, 1, 2),
        ];
        assert_eq!(selector.select(&eligible).unwrap().agent_id, "idle");
    }

    #[test]
    fn least_connections_ties_break_by_registration() {
        let selector = Selector::new(LoadBalanceStrategy::LeastConnections);
        let eligible = vec![snapshot("younger", 1, 1, 10), snapshot("elder", 1, 1, 0)];
        assert_eq!(selector.select(&eligible).unwrap().agent_id, "elder");
    }

    #[test]
    fn adaptive_without_history_falls_back_to_least_connections() {
        let selector = Selector::new(LoadBalanceStrategy::Adaptive);
        let eligible = vec![snapshot("busy", 3, 1, 0), snapshot("idle", 0, 1, 1)];
        assert_eq!(selector.select(&eligible).unwrap().agent_id, "idle");
    }

    #[test]
    fn adaptive_prefers_lower_latency() {
        let selector = Selector::new(LoadBalanceStrategy::Adaptive);
        for _ in 0..5 {
            selector.record_latency("slow", Duration::from_millis(500));
            selector.record_latency("fast", Duration::from_millis(20));
        }
        let eligible = vec![snapshot("slow", 0, 1, 0), snapshot("fast", 0, 1, 1)];
        assert_eq!(selector.select(&eligible).unwrap().agent_id, "fast");
    }

    #[test]
    fn adaptive_ewma_tracks_recent_samples() {
        let selector = Selector::new(LoadBalanceStrategy::Adaptive);
        selector.record_latency("a1", Duration::from_millis(100));
        // A burst of slow samples must move the average up.
        for _ in 0..20 {
            selector.record_latency("a1", Duration::from_millis(1000));
        }
        selector.record_latency("a2", Duration::from_millis(300));

        let eligible = vec![snapshot("a1", 0, 1, 0), snapshot("a2", 0, 1, 1)];
        assert_eq!(selector.select(&eligible).unwrap().agent_id, "a2");
    }
}
