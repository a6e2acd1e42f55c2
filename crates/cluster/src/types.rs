use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// mDNS service type hubs advertise under.
pub const SERVICE_NAME: &str = "_corral-hub._tcp";

/// Cluster configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Stable identity of this hub instance.
    pub node_id: String,
    /// Port the local hub listener is reachable on (advertised via mDNS).
    pub advertise_port: u16,
    /// How often the local agent set is published to peers.
    pub announce_interval: Duration,
    /// Silence tolerated before a peer and its shadow agents are dropped.
    pub peer_ttl: Duration,
    /// Interval of the peer staleness sweep.
    pub sweep_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            advertise_port: 0,
            announce_interval: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// A peer hub found via mDNS.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub ips: Vec<IpAddr>,
}

impl DiscoveredPeer {
    /// WebSocket URL for dialing this peer, preferring a resolved IP
    /// over the mDNS hostname.
    pub fn websocket_url(&self) -> String {
        match self.ips.first() {
            Some(ip) => format!("ws://{ip}:{}", self.port),
            None => format!("ws://{}:{}", self.host.trim_end_matches('.'), self.port),
        }
    }
}

/// Shadow view of one peer's locally registered agents.
///
/// Read-only on this side: used only to decide whether a task the local
/// pool cannot serve is worth forwarding.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: String,
    pub last_seen: Instant,
    /// agent_id -> declared capabilities, as last announced.
    pub agents: HashMap<String, HashSet<String>>,
}

impl PeerRecord {
    /// Returns `true` if any announced agent declares the task type.
    pub fn can_serve(&self, task_type: &str) -> bool {
        self.agents.values().any(|caps| caps.contains(task_type))
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_seen.elapsed() >= ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_prefers_ip() {
        let peer = DiscoveredPeer {
            node_id: "n1".into(),
            host: "hub-a.local.".into(),
            port: 7400,
            ips: vec!["192.168.1.20".parse().unwrap()],
        };
        assert_eq!(peer.websocket_url(), "ws://192.168.1.20:7400");
    }

    #[test]
    fn websocket_url_falls_back_to_hostname() {
        let peer = DiscoveredPeer {
            node_id: "n1".into(),
            host: "hub-a.local.".into(),
            port: 7400,
            ips: vec![],
        };
        assert_eq!(peer.websocket_url(), "ws://hub-a.local:7400");
    }

    #[test]
    fn peer_record_capability_check() {
        let mut agents = HashMap::new();
        agents.insert(
            "a1".to_string(),
            ["echo", "search"].iter().map(|s| s.to_string()).collect(),
        );
        let record = PeerRecord {
            node_id: "n1".into(),
            last_seen: Instant::now(),
            agents,
        };
        assert!(record.can_serve("echo"));
        assert!(!record.can_serve("translate"));
        assert!(!record.is_stale(Duration::from_secs(5)));
    }
}
