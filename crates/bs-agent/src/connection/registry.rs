//! Connection admission control

use dashmap::DashMap;
use std::sync::Mutex;

use bs_core::time::{current_time_millis, elapsed_duration};
use bs_core::ConnectionId;

/// Bookkeeping for one admitted connection
#[derive(Debug, Clone)]
struct ConnectionEntry {
    /// Unix millis at admission
    connected_at: u64,
}

/// Registry of admitted connections with a hard capacity
///
/// `is_active` is the single authorization gate: every request handler
/// checks it before touching any other service.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    capacity: usize,
    /// Serializes the count check with the insert
    admission: Mutex<()>,
}

impl ConnectionRegistry {
    /// Create a registry admitting at most `capacity` connections
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            capacity,
            admission: Mutex::new(()),
        }
    }

    /// Admit a connection. Returns false, with no side effect, when full.
    pub fn register(&self, id: &ConnectionId) -> bool {
        let _guard = self.admission.lock().unwrap_or_else(|e| e.into_inner());

        if self.connections.contains_key(id) {
            return true;
        }
        if self.connections.len() >= self.capacity {
            tracing::warn!(
                "Rejecting connection {}: {} of {} slots in use",
                id,
                self.connections.len(),
                self.capacity
            );
            return false;
        }

        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                connected_at: current_time_millis(),
            },
        );
        tracing::info!("Registered connection {}", id);
        true
    }

    /// Remove a connection. Returns whether it was present.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let _guard = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        match self.connections.remove(id) {
            Some((_, entry)) => {
                tracing::info!(
                    "Unregistered connection {} after {:?}",
                    id,
                    elapsed_duration(entry.connected_at)
                );
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(1)
    }
}
