//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide hub logic (registration, dispatch, clustering)
//! while the server framework handles connection management and routing.

use std::future::Future;
use std::pin::Pin;

use corral_protocol::constants::ERR_CODE_NOT_IMPLEMENTED;
use corral_protocol::envelope::Message;
use uuid::Uuid;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling WebSocket messages from connected peers.
///
/// The server dispatches parsed envelopes to the appropriate method. Each
/// method receives:
/// - `sender`: channel to send responses back to the originating peer
/// - `msg`: the parsed JSON envelope
///
/// Default implementations reply "not implemented" so handlers only need
/// to override the message types they care about.
pub trait Handler: Send + Sync + 'static {
    /// Called for `agent_register`.
    fn on_agent_register(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called for `heartbeat`.
    fn on_heartbeat(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `task_submit`.
    fn on_task_submit(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `task_result`.
    fn on_task_result(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `task_cancel`.
    fn on_task_cancel(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `peer_announce` (cluster traffic).
    fn on_peer_announce(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_CODE_NOT_IMPLEMENTED, "clustering disabled");
        })
    }

    /// Called when a peer disconnects (cleanup hook). Fires exactly once
    /// per connection, after the read pump exits.
    fn on_disconnect(&self, connection_id: Uuid) -> HandlerFuture<'_> {
        let _ = connection_id;
        Box::pin(async {})
    }
}
