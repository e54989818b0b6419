//! Live-connection tracking.

use crate::conn::Connection;
use dashmap::DashMap;
use std::sync::Arc;

/// Tracks every accepted-but-not-yet-closed connection by session id.
///
/// Entries are inserted in the accept path, before any authentication
/// decision, and removed when the wrapper's close signal fires. Missing and
/// duplicate keys are benign: removing an absent key is a no-op, which
/// guards against duplicate close delivery.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<String, Arc<dyn Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Registers a connection under its session id.
    pub fn insert(&self, conn: Arc<dyn Connection>) {
        self.entries.insert(conn.sid().to_string(), conn);
    }

    /// Removes a connection. Returns whether an entry was present.
    pub fn remove(&self, sid: &str) -> bool {
        self.entries.remove(sid).is_some()
    }

    /// Looks up a live connection.
    pub fn get(&self, sid: &str) -> Option<Arc<dyn Connection>> {
        self.entries.get(sid).map(|entry| entry.value().clone())
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroys every registered connection and empties the registry.
    ///
    /// Used by server shutdown. Unconditional: does not wait for in-flight
    /// application work.
    pub fn drain_destroy(&self) {
        let sids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for sid in sids {
            if let Some((_, conn)) = self.entries.remove(&sid) {
                conn.destroy();
            }
        }
    }
}
