//! Per-connection outbound delivery: a table of channels the transport
//! layer drains to write frames onto the wire, plus the fan-out helper
//! that walks a session's membership (via `connection_registry`) and
//! writes to every member but one.

use std::collections::HashMap;
use std::sync::Arc;

use connection_registry::ConnectionRegistry;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use wire::ServerFrame;

pub type OutboundSender = mpsc::UnboundedSender<ServerFrame>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<ServerFrame>;

/// Holds the sending half of each live connection's outbound channel. The
/// transport layer owns the receiving half and is responsible for writing
/// frames it pulls off onto the wire; this registry only knows how to
/// reach a connection, not how its bytes get there.
#[derive(Default)]
pub struct OutboundRegistry {
    senders: RwLock<HashMap<String, OutboundSender>>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        OutboundRegistry::default()
    }

    /// Registers a connection's outbound channel, returning the receiving
    /// half for the transport layer to drain.
    pub fn register(&self, connection_id: &str) -> OutboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().insert(connection_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, connection_id: &str) {
        self.senders.write().remove(connection_id);
    }

    /// Sends one frame to one connection. A closed channel (the
    /// connection already tore down) is not an error: the frame is simply
    /// dropped, since there is no one left to deliver it to.
    pub fn send_to(&self, connection_id: &str, frame: ServerFrame) {
        if let Some(sender) = self.senders.read().get(connection_id) {
            let _ = sender.send(frame);
        }
    }

    /// Delivers `frame` to every connection `registry` reports as a
    /// member of `session_id`, except `exclude` (the connection, if any,
    /// that caused the event and has already seen its own response).
    pub fn broadcast_to_session(
        &self,
        registry: &Arc<ConnectionRegistry>,
        session_id: &str,
        exclude: Option<&str>,
        frame: &ServerFrame,
    ) {
        for connection_id in registry.lookup_by_session(session_id) {
            if Some(connection_id.as_str()) == exclude {
                continue;
            }
            self.send_to(&connection_id, frame.clone());
        }
    }
}
