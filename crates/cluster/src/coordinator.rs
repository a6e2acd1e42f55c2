//! Peer table, announcements, and single-hop task forwarding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corral_dispatch::{ForwardError, ForwardFuture, Forwarder};
use corral_protocol::constants::{ERR_CODE_NO_CAPABLE_AGENT, MessageType, PEER_REQUEST_TIMEOUT};
use corral_protocol::messages::{PeerAnnounceEvent, TaskResultPayload, TaskSubmitRequest};
use corral_registry::AgentRegistry;

use crate::discovery::{Announcer, browse_peers};
use crate::link::PeerLink;
use crate::types::{ClusterConfig, DiscoveredPeer, PeerRecord};
use crate::ClusterError;

/// Margin added to a forwarded task's own deadline when waiting on the
/// peer, so the remote timeout fires first.
const FORWARD_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Time allowed for dialing a peer before giving up.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

struct PeerEntry {
    record: PeerRecord,
    address: Option<DiscoveredPeer>,
    link: Option<Arc<PeerLink>>,
}

/// Maintains the peer pool and forwards tasks the local pool cannot
/// serve. Forwarding is single-hop: the submission sent to a peer
/// carries the forwarded marker, and peers never re-forward.
pub struct ClusterCoordinator {
    config: ClusterConfig,
    registry: Arc<AgentRegistry>,
    peers: RwLock<HashMap<String, PeerEntry>>,
}

impl ClusterCoordinator {
    pub fn new(config: ClusterConfig, registry: Arc<AgentRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            peers: RwLock::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Number of peers with a live link.
    pub async fn connected_peer_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.link.as_ref().is_some_and(|l| l.is_connected()))
            .count()
    }

    /// Runs discovery, announcements, and staleness sweeps until
    /// cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // Advertise this hub.
        let mut announcer = Announcer::new(self.config.node_id.clone(), self.config.advertise_port);
        let announce_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = announcer.run(announce_cancel).await {
                tracing::error!("mDNS announcer failed: {e}");
            }
        });

        // Browse for peers.
        let (peers_tx, mut peers_rx) = mpsc::channel::<DiscoveredPeer>(16);
        tokio::spawn(browse_peers(
            self.config.node_id.clone(),
            peers_tx,
            cancel.clone(),
        ));

        let mut announce_ticker = tokio::time::interval(self.config.announce_interval);
        announce_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep_ticker = tokio::time::interval(self.config.sweep_interval);
        sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close_all_links().await;
                    break;
                }

                Some(peer) = peers_rx.recv() => {
                    self.on_peer_discovered(peer).await;
                }

                _ = announce_ticker.tick() => {
                    self.announce_once().await;
                }

                _ = sweep_ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Upserts a discovered peer and dials it if no link is live.
    pub async fn on_peer_discovered(&self, peer: DiscoveredPeer) {
        let needs_dial = {
            let mut peers = self.peers.write().await;
            let entry = peers
                .entry(peer.node_id.clone())
                .or_insert_with(|| PeerEntry {
                    record: PeerRecord {
                        node_id: peer.node_id.clone(),
                        last_seen: Instant::now(),
                        agents: HashMap::new(),
                    },
                    address: None,
                    link: None,
                });
            entry.record.last_seen = Instant::now();
            entry.address = Some(peer.clone());
            !entry.link.as_ref().is_some_and(|l| l.is_connected())
        };

        if needs_dial {
            if let Err(e) = self.dial(&peer).await {
                tracing::warn!(peer = %peer.node_id, "failed to dial peer: {e}");
            }
        }
    }

    /// Merges a peer's announced agent set into the shadow view.
    ///
    /// Called for announcements arriving on inbound connections as well
    /// as messages on our own links.
    pub async fn on_peer_announce(&self, ev: PeerAnnounceEvent) {
        if ev.node_id == self.config.node_id {
            return;
        }
        let mut peers = self.peers.write().await;
        let entry = peers.entry(ev.node_id.clone()).or_insert_with(|| PeerEntry {
            record: PeerRecord {
                node_id: ev.node_id.clone(),
                last_seen: Instant::now(),
                agents: HashMap::new(),
            },
            address: None,
            link: None,
        });
        entry.record.last_seen = Instant::now();
        entry.record.agents = ev
            .agents
            .into_iter()
            .map(|a| (a.agent_id, a.capabilities.into_iter().collect()))
            .collect();
        tracing::debug!(
            peer = %entry.record.node_id,
            agents = entry.record.agents.len(),
            "peer announcement merged"
        );
    }

    /// Publishes the local agent set to every connected peer.
    pub async fn announce_once(&self) {
        let agents = self.registry.peer_summary().await;
        let ev = PeerAnnounceEvent {
            node_id: self.config.node_id.clone(),
            agents,
        };

        let links: Vec<Arc<PeerLink>> = self
            .peers
            .read()
            .await
            .values()
            .filter_map(|p| p.link.clone())
            .filter(|l| l.is_connected())
            .collect();

        for link in links {
            let id = Uuid::new_v4().to_string();
            if let Err(e) = link
                .send_event(&id, MessageType::PeerAnnounce, Some(&ev))
                .await
            {
                tracing::debug!(peer = %link.node_id(), "announce failed: {e}");
            }
        }
    }

    /// Drops peers whose announcements and mDNS presence both went
    /// silent past the TTL.
    pub async fn sweep(&self) {
        let ttl = self.config.peer_ttl;
        let mut peers = self.peers.write().await;
        peers.retain(|node_id, entry| {
            if entry.record.is_stale(ttl) {
                tracing::warn!(peer = %node_id, "peer stale, dropping");
                if let Some(link) = &entry.link {
                    link.close();
                }
                false
            } else {
                true
            }
        });
        metrics::gauge!("corral_cluster_peers").set(peers.len() as f64);
    }

    async fn dial(&self, peer: &DiscoveredPeer) -> Result<(), ClusterError> {
        let url = peer.websocket_url();
        let link = tokio::time::timeout(DIAL_TIMEOUT, PeerLink::connect(&peer.node_id, &url))
            .await
            .map_err(|_| ClusterError::Timeout)??;

        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(&peer.node_id) {
            entry.link = Some(Arc::new(link));
        }
        Ok(())
    }

    async fn close_all_links(&self) {
        let peers = self.peers.read().await;
        for entry in peers.values() {
            if let Some(link) = &entry.link {
                link.close();
            }
        }
    }

    /// Peers able to serve the task type, freshest first.
    async fn capable_peers(&self, task_type: &str) -> Vec<(Instant, Arc<PeerLink>)> {
        let peers = self.peers.read().await;
        let mut capable: Vec<(Instant, Arc<PeerLink>)> = peers
            .values()
            .filter(|p| p.record.can_serve(task_type))
            .filter_map(|p| {
                let link = p.link.clone()?;
                link.is_connected().then_some((p.record.last_seen, link))
            })
            .collect();
        capable.sort_by(|a, b| b.0.cmp(&a.0));
        capable
    }
}

impl Forwarder for ClusterCoordinator {
    /// Forwards a task to one capable peer and waits for its terminal
    /// outcome. Tries peers freshest-first; a peer that answers
    /// "no capable agent" (its pool changed) is skipped for the next.
    fn forward(&self, task: TaskSubmitRequest) -> ForwardFuture<'_> {
        Box::pin(async move {
            let candidates = self.capable_peers(&task.task_type).await;
            if candidates.is_empty() {
                return Err(ForwardError::NoCapablePeer);
            }

            let timeout = task
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(PEER_REQUEST_TIMEOUT)
                + FORWARD_TIMEOUT_MARGIN;

            for (_, link) in candidates {
                metrics::counter!("corral_cluster_forward_attempts_total").increment(1);
                tracing::info!(
                    task_id = %task.task_id,
                    peer = %link.node_id(),
                    "forwarding task to peer"
                );

                let response = link
                    .request(
                        &task.task_id,
                        MessageType::TaskSubmit,
                        Some(&task),
                        timeout,
                    )
                    .await;

                match response {
                    Ok(msg) if msg.msg_type == MessageType::TaskComplete => {
                        match msg.parse_payload::<TaskResultPayload>() {
                            Ok(Some(payload)) => return Ok(payload),
                            _ => {
                                return Err(ForwardError::PeerUnreachable(format!(
                                    "peer {} returned an unreadable result",
                                    link.node_id()
                                )));
                            }
                        }
                    }
                    Ok(msg) => {
                        if let Some(err) = &msg.error {
                            if err.code == ERR_CODE_NO_CAPABLE_AGENT {
                                // Its pool changed since the announcement.
                                tracing::debug!(
                                    task_id = %task.task_id,
                                    peer = %link.node_id(),
                                    "peer has no capable agent, trying next"
                                );
                                continue;
                            }
                            return Err(ForwardError::PeerUnreachable(format!(
                                "peer {} error {}: {}",
                                link.node_id(),
                                err.code,
                                err.message
                            )));
                        }
                        return Err(ForwardError::PeerUnreachable(format!(
                            "peer {} sent unexpected {:?}",
                            link.node_id(),
                            msg.msg_type
                        )));
                    }
                    Err(ClusterError::Timeout) | Err(ClusterError::Closed) => {
                        tracing::warn!(
                            task_id = %task.task_id,
                            peer = %link.node_id(),
                            "peer unresponsive, trying next"
                        );
                        continue;
                    }
                    Err(e) => {
                        return Err(ForwardError::PeerUnreachable(e.to_string()));
                    }
                }
            }

            Err(ForwardError::NoCapablePeer)
        })
    }
}
