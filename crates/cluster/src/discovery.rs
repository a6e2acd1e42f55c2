//! mDNS announce and browse for hub peers.

use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo as MdnsServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ClusterError;
use crate::types::{DiscoveredPeer, SERVICE_NAME};

/// Advertises this hub on the local network via mDNS/DNS-SD.
pub struct Announcer {
    node_id: String,
    port: u16,
    daemon: Option<ServiceDaemon>,
}

impl Announcer {
    pub fn new(node_id: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            port,
            daemon: None,
        }
    }

    /// Begins advertising the hub on the network.
    ///
    /// Safe to call multiple times: stops the existing daemon before
    /// re-registering.
    pub fn start(&mut self) -> Result<(), ClusterError> {
        if self.port == 0 {
            return Err(ClusterError::Config(
                "advertise port must be set before starting mDNS announcer".into(),
            ));
        }

        self.stop();

        let daemon = ServiceDaemon::new()
            .map_err(|e| ClusterError::Mdns(format!("failed to create mDNS daemon: {e}")))?;

        let ips = get_local_ips();
        if ips.is_empty() {
            return Err(ClusterError::Network("no valid network IPs found".into()));
        }

        let hostname = get_hostname();
        let service_type = format!("{SERVICE_NAME}.local.");
        let properties = [("node_id", self.node_id.as_str())];

        let service = MdnsServiceInfo::new(
            &service_type,
            &self.node_id,
            &hostname,
            &ips[..],
            self.port,
            &properties[..],
        )
        .map_err(|e| ClusterError::Mdns(format!("failed to create service info: {e}")))?;

        daemon
            .register(service)
            .map_err(|e| ClusterError::Mdns(format!("failed to register mDNS service: {e}")))?;

        self.daemon = Some(daemon);
        tracing::info!(node_id = %self.node_id, port = self.port, "announcing hub via mDNS");
        Ok(())
    }

    /// Stops advertising the hub.
    pub fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            let service_type = format!("{SERVICE_NAME}.local.");
            let full_name = format!("{}.{service_type}", self.node_id);
            let _ = daemon.unregister(&full_name);
            let _ = daemon.shutdown();
        }
    }

    /// Starts the announcer and runs until the token is cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ClusterError> {
        self.start()?;
        cancel.cancelled().await;
        self.stop();
        Ok(())
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Browses for peer hubs until cancelled, emitting each resolved peer.
///
/// One `ServiceDaemon` lives for the whole session; `mdns_sd`'s receiver
/// is blocking, so reads happen via `spawn_blocking`.
pub async fn browse_peers(
    local_node_id: String,
    events_tx: mpsc::Sender<DiscoveredPeer>,
    cancel: CancellationToken,
) {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("failed to create mDNS daemon: {e}");
            return;
        }
    };

    let service_type = format!("{SERVICE_NAME}.local.");
    let event_rx = match daemon.browse(&service_type) {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!("failed to browse mDNS: {e}");
            let _ = daemon.shutdown();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = daemon.shutdown();
                return;
            }

            result = tokio::task::spawn_blocking({
                let rx = event_rx.clone();
                move || rx.recv_timeout(std::time::Duration::from_millis(500))
            }) => {
                if let Ok(Ok(event)) = result {
                    if let Some(peer) = process_event(&event) {
                        if peer.node_id != local_node_id {
                            let _ = events_tx.send(peer).await;
                        }
                    }
                }
            }
        }
    }
}

/// Turns a resolved mDNS service event into a [`DiscoveredPeer`].
fn process_event(event: &ServiceEvent) -> Option<DiscoveredPeer> {
    let ServiceEvent::ServiceResolved(info) = event else {
        return None;
    };

    let mut node_id = String::new();
    for property in info.get_properties().iter() {
        if property.key() == "node_id" {
            node_id = property.val_str().to_string();
        }
    }
    if node_id.is_empty() {
        node_id = info.get_fullname().to_string();
    }

    let ips: Vec<IpAddr> = info
        .get_addresses()
        .iter()
        .filter_map(|ip| {
            let ip4 = match ip {
                IpAddr::V4(v4) => *v4,
                _ => return None,
            };
            if ip4.octets()[0] == 127 {
                return None;
            }
            if ip4.octets()[0] == 169 && ip4.octets()[1] == 254 {
                return None;
            }
            Some(IpAddr::V4(ip4))
        })
        .collect();

    Some(DiscoveredPeer {
        node_id,
        host: info.get_hostname().to_string(),
        port: info.get_port(),
        ips,
    })
}

/// Returns local non-loopback IPv4 addresses, excluding link-local.
pub fn get_local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();

    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return ips;
    };

    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        if let IpAddr::V4(ipv4) = iface.ip() {
            if ipv4.octets()[0] == 127 {
                continue;
            }
            if ipv4.octets()[0] == 169 && ipv4.octets()[1] == 254 {
                continue;
            }
            ips.push(IpAddr::V4(ipv4));
        }
    }

    ips
}

/// Returns the local hostname suffixed with `.local.` as mDNS requires.
pub fn get_hostname() -> String {
    let mut name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into());

    if !name.ends_with(".local.") {
        name = name.trim_end_matches('.').to_string();
        name.push_str(".local.");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcer_requires_port() {
        let mut announcer = Announcer::new("node-1", 0);
        assert!(announcer.start().is_err());
    }

    #[test]
    fn get_hostname_returns_mdns_suffix() {
        let h = get_hostname();
        assert!(h.ends_with(".local."));
    }
}
