//! WebSocket listener for the Corral hub.
//!
//! Accepts persistent connections from agents, clients, and peer hubs,
//! dispatches JSON envelopes to a [`Handler`] trait, and manages the
//! connection lifecycle (ping/pong, idle eviction, graceful shutdown).

mod connection;
mod handler;
mod server;

pub use connection::{ConnMeta, Connection, SendError, Sender, spawn_connection};
pub use handler::{Handler, HandlerFuture};
pub use server::{Connections, HubListener, ListenerConfig};

/// Errors produced by the hub listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection not found: {0}")]
    UnknownConnection(uuid::Uuid),
}
