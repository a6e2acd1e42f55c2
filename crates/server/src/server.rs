//! Hub WebSocket listener.
//!
//! Listens on a TCP port, upgrades inbound connections to WebSocket, and
//! manages the table of live peer connections. Unlike a point-to-point
//! link there is no notion of "the" peer: agents, clients, and peer hubs
//! all arrive here and are told apart by the messages they send.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corral_protocol::constants::WS_MAX_MESSAGE_SIZE;
use corral_protocol::envelope::Message;

use crate::ServerError;
use crate::connection::{ConnMeta, Connection, spawn_connection};
use crate::handler::Handler;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub listen_addr: SocketAddr,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 0).into(),
        }
    }
}

/// Table of live peer connections, shared with the components that need
/// to deliver messages (dispatcher, cluster coordinator).
#[derive(Default)]
pub struct Connections {
    inner: RwLock<HashMap<Uuid, Connection>>,
}

impl Connections {
    /// Sends a message to a specific connection.
    ///
    /// Fails when the connection is gone or its queue overflowed (in
    /// which case the connection is being torn down).
    pub async fn send_to(&self, connection_id: Uuid, msg: Message) -> Result<(), ServerError> {
        let guard = self.inner.read().await;
        let conn = guard
            .get(&connection_id)
            .ok_or(ServerError::UnknownConnection(connection_id))?;
        conn.sender()
            .send_msg(msg)
            .map_err(|_| ServerError::UnknownConnection(connection_id))
    }

    /// Closes a connection, waiting for its cleanup to finish.
    pub async fn close(&self, connection_id: Uuid) {
        let conn = self.inner.write().await.remove(&connection_id);
        if let Some(conn) = conn {
            conn.close_and_wait().await;
        }
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    pub(crate) async fn insert(&self, conn: Connection) {
        self.inner
            .write()
            .await
            .insert(conn.meta.connection_id, conn);
    }

    pub(crate) async fn remove(&self, connection_id: Uuid) {
        self.inner.write().await.remove(&connection_id);
    }

    pub(crate) async fn prune_if_closed(&self, connection_id: Uuid) {
        let mut guard = self.inner.write().await;
        if guard.get(&connection_id).is_some_and(|c| c.is_closed()) {
            guard.remove(&connection_id);
        }
    }

    /// Closes every connection (shutdown path).
    pub async fn close_all(&self) {
        let conns: Vec<Connection> = {
            let mut guard = self.inner.write().await;
            guard.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            conn.close_and_wait().await;
        }
    }
}

/// The hub WebSocket listener.
///
/// Accepts connections, spawns pump tasks for each, and keeps the shared
/// [`Connections`] table current.
pub struct HubListener<H: Handler> {
    config: ListenerConfig,
    handler: Arc<H>,
    connections: Arc<Connections>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> HubListener<H> {
    /// Creates a new listener with the given handler.
    pub fn new(config: ListenerConfig, handler: Arc<H>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            connections: Arc::new(Connections::default()),
            cancel,
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the shared connection table.
    pub fn connections(&self) -> Arc<Connections> {
        Arc::clone(&self.connections)
    }

    /// Returns the local address the listener is bound to.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Signals shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the listener until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("hub listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("listener shutting down");
                    self.connections.close_all().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades a TCP connection to WebSocket and registers it.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let meta = ConnMeta {
            connection_id: Uuid::new_v4(),
            remote_addr: peer_addr.to_string(),
        };
        tracing::info!(
            connection_id = %meta.connection_id,
            %peer_addr,
            "WebSocket connection established"
        );
        metrics::counter!("corral_connections_accepted_total").increment(1);

        let connection_id = meta.connection_id;
        let connections = Arc::clone(&self.connections);
        let handler = TableCleanup {
            inner: Arc::clone(&self.handler),
            connections,
        };

        let conn = spawn_connection(ws_stream, meta, Arc::new(handler), self.cancel.clone());
        self.connections.insert(conn).await;
        metrics::gauge!("corral_connections_active").increment(1.0);

        // The read pump may already have exited (instant disconnect), in
        // which case its table cleanup ran before the insert above.
        self.connections.prune_if_closed(connection_id).await;
        Ok(())
    }
}

/// Wraps the user handler so the connection table is pruned before the
/// disconnect hook runs.
struct TableCleanup<H: Handler> {
    inner: Arc<H>,
    connections: Arc<Connections>,
}

impl<H: Handler> Handler for TableCleanup<H> {
    fn on_agent_register(
        &self,
        sender: crate::connection::Sender,
        msg: Message,
    ) -> crate::handler::HandlerFuture<'_> {
        self.inner.on_agent_register(sender, msg)
    }

    fn on_heartbeat(
        &self,
        sender: crate::connection::Sender,
        msg: Message,
    ) -> crate::handler::HandlerFuture<'_> {
        self.inner.on_heartbeat(sender, msg)
    }

    fn on_task_submit(
        &self,
        sender: crate::connection::Sender,
        msg: Message,
    ) -> crate::handler::HandlerFuture<'_> {
        self.inner.on_task_submit(sender, msg)
    }

    fn on_task_result(
        &self,
        sender: crate::connection::Sender,
        msg: Message,
    ) -> crate::handler::HandlerFuture<'_> {
        self.inner.on_task_result(sender, msg)
    }

    fn on_task_cancel(
        &self,
        sender: crate::connection::Sender,
        msg: Message,
    ) -> crate::handler::HandlerFuture<'_> {
        self.inner.on_task_cancel(sender, msg)
    }

    fn on_peer_announce(
        &self,
        sender: crate::connection::Sender,
        msg: Message,
    ) -> crate::handler::HandlerFuture<'_> {
        self.inner.on_peer_announce(sender, msg)
    }

    fn on_disconnect(&self, connection_id: Uuid) -> crate::handler::HandlerFuture<'_> {
        Box::pin(async move {
            self.connections.remove(connection_id).await;
            metrics::gauge!("corral_connections_active").decrement(1.0);
            self.inner.on_disconnect(connection_id).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Sender;
    use crate::handler::HandlerFuture;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Minimal test handler.
    struct TestHandler {
        registered: AtomicBool,
        disconnects: AtomicUsize,
    }

    impl TestHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                registered: AtomicBool::new(false),
                disconnects: AtomicUsize::new(0),
            })
        }
    }

    impl Handler for TestHandler {
        fn on_agent_register(&self, _sender: Sender, _msg: Message) -> HandlerFuture<'_> {
            self.registered.store(true, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_disconnect(&self, _connection_id: Uuid) -> HandlerFuture<'_> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    async fn start_listener(
        handler: Arc<TestHandler>,
    ) -> (Arc<HubListener<TestHandler>>, SocketAddr) {
        let listener = HubListener::new(
            ListenerConfig::default(),
            handler,
            CancellationToken::new(),
        );
        let run = Arc::clone(&listener);
        tokio::spawn(async move {
            run.run().await.unwrap();
        });
        // Wait for the listener to bind.
        for _ in 0..50 {
            if let Some(addr) = listener.local_addr().await {
                return (listener, addr);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("listener did not bind");
    }

    #[tokio::test]
    async fn listener_binds_dynamic_port() {
        let (listener, addr) = start_listener(TestHandler::new()).await;
        assert!(addr.port() > 0, "should have bound to a dynamic port");
        assert_eq!(listener.connections().count().await, 0);
        listener.shutdown();
    }

    #[tokio::test]
    async fn listener_tracks_connections() {
        let handler = TestHandler::new();
        let (listener, addr) = start_listener(Arc::clone(&handler)).await;

        let url = format!("ws://127.0.0.1:{}", addr.port());
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(listener.connections().count().await, 1);

        drop(ws);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(listener.connections().count().await, 0);
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);

        listener.shutdown();
    }

    #[tokio::test]
    async fn listener_dispatches_register_message() {
        use futures_util::SinkExt;

        let handler = TestHandler::new();
        let (listener, addr) = start_listener(Arc::clone(&handler)).await;

        let url = format!("ws://127.0.0.1:{}", addr.port());
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let msg = serde_json::json!({
            "id": "test-1",
            "type": "agent_register",
            "payload": {
                "agentId": "agent-1",
                "agentType": "worker",
                "capabilities": ["echo"]
            }
        });
        ws.send(tokio_tungstenite::tungstenite::Message::Text(
            msg.to_string().into(),
        ))
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(handler.registered.load(Ordering::SeqCst));

        drop(ws);
        listener.shutdown();
    }

    #[tokio::test]
    async fn malformed_json_closes_connection() {
        use futures_util::SinkExt;

        let handler = TestHandler::new();
        let (listener, addr) = start_listener(Arc::clone(&handler)).await;

        let url = format!("ws://127.0.0.1:{}", addr.port());
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        ws.send(tokio_tungstenite::tungstenite::Message::Text(
            "{not json".into(),
        ))
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(listener.connections().count().await, 0);

        listener.shutdown();
    }

    #[tokio::test]
    async fn send_to_unknown_connection_fails() {
        let (listener, _addr) = start_listener(TestHandler::new()).await;
        let msg = Message::new::<()>("m1", corral_protocol::MessageType::Heartbeat, None).unwrap();
        let result = listener.connections().send_to(Uuid::new_v4(), msg).await;
        assert!(matches!(result, Err(ServerError::UnknownConnection(_))));
        listener.shutdown();
    }
}
