//! Protocol message routing.
//!
//! Implements the server's [`Handler`] trait, wiring inbound envelopes
//! into the registry, dispatcher, and cluster coordinator. Connections
//! have no declared role: one becomes an agent by registering, stays a
//! client (or peer hub) otherwise.

use std::sync::{Arc, OnceLock};

use uuid::Uuid;

use corral_cluster::ClusterCoordinator;
use corral_dispatch::{DispatchError, TaskDispatcher};
use corral_protocol::constants::{
    ERR_CODE_INTERNAL, ERR_CODE_NO_CAPABLE_AGENT, ERR_CODE_PROTOCOL, ERR_CODE_QUEUE_CAPACITY,
    ERR_CODE_TASK_EXISTS, ERR_CODE_UNKNOWN_TASK, MessageType,
};
use corral_protocol::envelope::Message;
use corral_protocol::messages::{
    AgentRegisterRequest, HeartbeatEvent, PeerAnnounceEvent, RegisterAckResponse,
    TaskAcceptedResponse, TaskCancelRequest, TaskResultPayload, TaskSubmitRequest,
};
use corral_registry::AgentRegistry;
use corral_server::{Connections, Handler, HandlerFuture, Sender};

/// Routes protocol messages to the hub's components.
pub struct HubRouter {
    registry: Arc<AgentRegistry>,
    heartbeat_interval_secs: u64,
    dispatcher: OnceLock<Arc<TaskDispatcher>>,
    connections: OnceLock<Arc<Connections>>,
    cluster: OnceLock<Arc<ClusterCoordinator>>,
}

impl HubRouter {
    pub fn new(registry: Arc<AgentRegistry>, heartbeat_interval_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            registry,
            heartbeat_interval_secs,
            dispatcher: OnceLock::new(),
            connections: OnceLock::new(),
            cluster: OnceLock::new(),
        })
    }

    /// Wires the dispatcher in after construction (the dispatcher needs
    /// the connection table, which needs the listener, which needs this
    /// router).
    pub fn set_dispatcher(&self, dispatcher: Arc<TaskDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    pub fn set_connections(&self, connections: Arc<Connections>) {
        let _ = self.connections.set(connections);
    }

    pub fn set_cluster(&self, cluster: Arc<ClusterCoordinator>) {
        let _ = self.cluster.set(cluster);
    }

    /// Parses a payload or answers with a protocol error and closes the
    /// connection (malformed frames are not tolerated).
    fn parse_or_close<T: for<'de> serde::Deserialize<'de>>(
        sender: &Sender,
        msg: &Message,
    ) -> Option<T> {
        match msg.parse_payload::<T>() {
            Ok(Some(payload)) => Some(payload),
            _ => {
                tracing::warn!(
                    connection_id = %sender.connection_id(),
                    msg_type = ?msg.msg_type,
                    "missing or malformed payload, closing connection"
                );
                let _ = sender.send_error(msg, ERR_CODE_PROTOCOL, "malformed payload");
                sender.close();
                None
            }
        }
    }

    fn dispatch_error_reply(sender: &Sender, msg: &Message, err: &DispatchError) {
        let (code, text) = match err {
            DispatchError::TaskExists(_) => (ERR_CODE_TASK_EXISTS, err.to_string()),
            DispatchError::QueueCapacityExceeded => (ERR_CODE_QUEUE_CAPACITY, err.to_string()),
            DispatchError::NoCapableAgent(_) => (ERR_CODE_NO_CAPABLE_AGENT, err.to_string()),
            DispatchError::UnknownTask(_) => (ERR_CODE_UNKNOWN_TASK, err.to_string()),
        };
        let _ = sender.send_error(msg, code, &text);
    }
}

impl Handler for HubRouter {
    fn on_agent_register(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = Self::parse_or_close::<AgentRegisterRequest>(&sender, &msg) else {
                return;
            };

            match self.registry.register(sender.connection_id(), &req).await {
                Ok(outcome) => {
                    // Last registration wins: evict the stale connection.
                    if let Some(old) = outcome.displaced_connection {
                        if let Some(connections) = self.connections.get() {
                            connections.close(old).await;
                        }
                    }
                    let ack = RegisterAckResponse {
                        agent_id: req.agent_id,
                        heartbeat_interval_secs: self.heartbeat_interval_secs,
                    };
                    if let Ok(reply) = msg.reply(MessageType::RegisterAck, Some(&ack)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %sender.connection_id(),
                        "registration rejected: {e}"
                    );
                    let _ = sender.send_error(&msg, ERR_CODE_PROTOCOL, &e.to_string());
                }
            }
        })
    }

    fn on_heartbeat(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(hb) = Self::parse_or_close::<HeartbeatEvent>(&sender, &msg) else {
                return;
            };
            if self.registry.heartbeat(&hb.agent_id).await.is_err() {
                // Unknown to us (e.g. hub restarted): tell the agent to
                // register again instead of silently dropping beats.
                let _ = sender.send_error(&msg, ERR_CODE_PROTOCOL, "unknown agent, re-register");
            }
        })
    }

    fn on_task_submit(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = Self::parse_or_close::<TaskSubmitRequest>(&sender, &msg) else {
                return;
            };
            let Some(dispatcher) = self.dispatcher.get() else {
                let _ = sender.send_error(&msg, ERR_CODE_INTERNAL, "dispatcher not ready");
                return;
            };

            let task_id = req.task_id.clone();
            match dispatcher.submit(req, Some(sender.connection_id())).await {
                Ok(()) => {
                    let ack = TaskAcceptedResponse { task_id };
                    if let Ok(reply) = msg.reply(MessageType::TaskAccepted, Some(&ack)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => Self::dispatch_error_reply(&sender, &msg, &e),
            }
        })
    }

    fn on_task_result(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(result) = Self::parse_or_close::<TaskResultPayload>(&sender, &msg) else {
                return;
            };
            // Only the connection the agent registered over may report.
            let Some(agent_id) = self
                .registry
                .agent_for_connection(sender.connection_id())
                .await
            else {
                let _ = sender.send_error(&msg, ERR_CODE_PROTOCOL, "connection is not an agent");
                return;
            };
            let Some(dispatcher) = self.dispatcher.get() else {
                return;
            };
            // Stale results are logged inside; nothing to tell the agent.
            let _ = dispatcher.on_result(&agent_id, result).await;
        })
    }

    fn on_task_cancel(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = Self::parse_or_close::<TaskCancelRequest>(&sender, &msg) else {
                return;
            };
            let Some(dispatcher) = self.dispatcher.get() else {
                return;
            };
            // On success the requester's cancelled notice doubles as the
            // acknowledgment; only failures get a direct reply.
            if let Err(e) = dispatcher.cancel(&req.task_id).await {
                Self::dispatch_error_reply(&sender, &msg, &e);
            }
        })
    }

    fn on_peer_announce(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(cluster) = self.cluster.get() else {
                let _ = sender.send_error(
                    &msg,
                    corral_protocol::constants::ERR_CODE_NOT_IMPLEMENTED,
                    "clustering disabled",
                );
                return;
            };
            let Some(ev) = Self::parse_or_close::<PeerAnnounceEvent>(&sender, &msg) else {
                return;
            };
            cluster.on_peer_announce(ev).await;
        })
    }

    fn on_disconnect(&self, connection_id: Uuid) -> HandlerFuture<'_> {
        Box::pin(async move {
            // The offline cascade (requeueing held tasks) rides on the
            // registry's event stream, consumed by the hub event loop.
            if let Some(agent_id) = self.registry.connection_closed(connection_id).await {
                tracing::info!(
                    connection_id = %connection_id,
                    agent_id = %agent_id,
                    "agent connection lost"
                );
            }
        })
    }
}
