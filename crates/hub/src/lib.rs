//! Corral hub: component wiring and runtime.
//!
//! Composes the WebSocket listener, agent registry, task dispatcher,
//! optional cluster coordinator, and the ops surface into one runnable
//! [`Hub`].

mod config;
mod hub;
mod router;

pub use config::{BreakerSection, ClusterSection, HubConfig};
pub use hub::Hub;
pub use router::HubRouter;
