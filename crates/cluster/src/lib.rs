//! Cluster coordination for the Corral hub.
//!
//! Hubs discover each other over mDNS, maintain WebSocket links, and
//! periodically publish their locally registered agent sets. A hub that
//! cannot serve a task locally forwards it to one capable peer
//! (single-hop; forwarded tasks are never re-forwarded).

pub mod coordinator;
pub mod discovery;
pub mod link;
pub mod types;

pub use coordinator::ClusterCoordinator;
pub use types::ClusterConfig;

/// Errors produced by the cluster layer.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("mDNS error: {0}")]
    Mdns(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("peer request timed out")]
    Timeout,

    #[error("peer link closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),
}
