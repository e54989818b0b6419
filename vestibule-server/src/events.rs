//! Lifecycle event fan-out.

use crate::error::ServerError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default capacity of the event channel.
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Lifecycle event published by the server shell.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The listener is bound and accepting.
    Listening(SocketAddr),
    /// Transport-fatal listener error.
    Error(Arc<ServerError>),
    /// Non-fatal fault on a connection that had not yet authenticated.
    ///
    /// Distinct from `Error` on purpose: pre-auth faults originate from the
    /// peer (load-balancer probes, aborted handshakes) and must not read as
    /// a server malfunction. Subscribers wanting full visibility listen for
    /// both.
    Warn {
        /// Session id of the offending connection.
        sid: String,
        error: Arc<ServerError>,
    },
    /// The listener stopped.
    Closed,
}

/// Publishes [`ServerEvent`]s to zero or more subscribers.
pub struct EventHub {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Registers a new subscriber. Events published before this call are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
