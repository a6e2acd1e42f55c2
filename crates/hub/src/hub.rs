//! Hub runtime: builds every component from configuration, spawns the
//! background sweepers, and owns the shutdown token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corral_cluster::ClusterCoordinator;
use corral_dispatch::{DeliveryFuture, Forwarder, Outbound, TaskDispatcher};
use corral_ops::{HealthFuture, HealthSource};
use corral_protocol::envelope::Message;
use corral_protocol::types::AgentSummary;
use corral_registry::{AgentRegistry, RegistryEvent};
use corral_server::{Connections, HubListener, ListenerConfig};

use crate::config::HubConfig;
use crate::router::HubRouter;

/// Delivery sink backed by the server's connection table.
struct ConnectionSink(Arc<Connections>);

impl Outbound for ConnectionSink {
    fn deliver(&self, connection_id: Uuid, msg: Message) -> DeliveryFuture<'_> {
        Box::pin(async move { self.0.send_to(connection_id, msg).await.map_err(|_| ()) })
    }
}

/// Health counts drawn from the live components.
struct HubHealth {
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    connections: Arc<Connections>,
}

impl HealthSource for HubHealth {
    fn agents(&self) -> HealthFuture<'_, Vec<AgentSummary>> {
        Box::pin(async move { self.registry.snapshot().await })
    }

    fn tasks_pending(&self) -> HealthFuture<'_, usize> {
        Box::pin(async move { self.dispatcher.pending_count().await })
    }

    fn connections(&self) -> HealthFuture<'_, usize> {
        Box::pin(async move { self.connections.count().await })
    }
}

/// A running coordination hub.
pub struct Hub {
    cancel: CancellationToken,
    listener: Arc<HubListener<HubRouter>>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    cluster: Option<Arc<ClusterCoordinator>>,
}

impl Hub {
    /// Builds and starts a hub from configuration.
    ///
    /// Returns once the WebSocket listener is bound.
    pub async fn start(config: HubConfig) -> anyhow::Result<Arc<Self>> {
        let cancel = CancellationToken::new();

        let (registry, mut registry_events) = AgentRegistry::new(config.registry_config());
        let router = HubRouter::new(Arc::clone(&registry), config.heartbeat_interval_secs);
        let listener = HubListener::new(
            ListenerConfig {
                listen_addr: config.listen_addr,
            },
            Arc::clone(&router),
            cancel.child_token(),
        );
        let connections = listener.connections();
        router.set_connections(Arc::clone(&connections));

        let dispatcher = TaskDispatcher::new(
            config.dispatcher_config(),
            Arc::clone(&registry),
            Arc::new(ConnectionSink(Arc::clone(&connections))),
        );
        router.set_dispatcher(Arc::clone(&dispatcher));

        // Listener first, so the bound port is known for mDNS.
        {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    tracing::error!("listener failed: {e}");
                }
            });
        }
        let bound = wait_for_bind(&listener).await?;

        let cluster = if config.cluster.enabled {
            let coordinator = ClusterCoordinator::new(
                config.cluster_config(bound.port()),
                Arc::clone(&registry),
            );
            dispatcher.set_forwarder(Arc::clone(&coordinator) as Arc<dyn Forwarder>);
            router.set_cluster(Arc::clone(&coordinator));
            tokio::spawn(Arc::clone(&coordinator).run(cancel.child_token()));
            Some(coordinator)
        } else {
            None
        };

        tokio::spawn(Arc::clone(&registry).run_sweeper(cancel.child_token()));
        tokio::spawn(Arc::clone(&dispatcher).run_timeout_sweeper(cancel.child_token()));

        // Registry liveness events drive the dispatcher's requeue and
        // queue-drain paths.
        {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        ev = registry_events.recv() => match ev {
                            Some(RegistryEvent::AgentOnline { agent_id }) => {
                                dispatcher.on_agent_online(&agent_id).await;
                            }
                            Some(RegistryEvent::AgentOffline { agent_id }) => {
                                dispatcher.on_agent_offline(&agent_id).await;
                            }
                            None => break,
                        },
                    }
                }
            });
        }

        // Operator surface.
        {
            let health = Arc::new(HubHealth {
                registry: Arc::clone(&registry),
                dispatcher: Arc::clone(&dispatcher),
                connections: Arc::clone(&connections),
            });
            let prometheus = corral_ops::recorder_handle();
            let ops_addr = config.ops_addr;
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = corral_ops::serve(ops_addr, health, prometheus, cancel).await {
                    tracing::error!("ops surface failed: {e}");
                }
            });
        }

        tracing::info!(
            node_id = %config.node_id,
            listen = %bound,
            cluster = config.cluster.enabled,
            "hub started"
        );

        Ok(Arc::new(Self {
            cancel,
            listener,
            registry,
            dispatcher,
            cluster,
        }))
    }

    /// Address the WebSocket listener is bound to.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().await
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn dispatcher(&self) -> Arc<TaskDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn cluster(&self) -> Option<Arc<ClusterCoordinator>> {
        self.cluster.clone()
    }

    /// Signals every component to stop.
    pub fn shutdown(&self) {
        tracing::info!("hub shutting down");
        self.cancel.cancel();
    }

    /// Waits until shutdown has been requested.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }
}

async fn wait_for_bind(listener: &HubListener<HubRouter>) -> anyhow::Result<SocketAddr> {
    for _ in 0..100 {
        if let Some(addr) = listener.local_addr().await {
            return Ok(addr);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("listener did not bind in time")
}
