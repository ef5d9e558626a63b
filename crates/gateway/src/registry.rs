//! Live connections, keyed by connection id.
//!
//! Entries are inserted when a connection authenticates and removed when
//! its [`Registration`] is dropped. The registry holds snapshots only; each
//! connection owns its authoritative state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::state::{ConnectionId, ConnectionState, ProtocolState};

#[derive(Default)]
pub struct ConnectionRegistry {
    // Held briefly and never across an await.
    entries: Mutex<HashMap<ConnectionId, ConnectionState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `state`; the entry lives as long as the returned guard.
    pub fn register(self: &Arc<Self>, state: ConnectionState) -> Registration {
        let id = state.id.clone();
        self.lock().insert(id.clone(), state);
        debug!(connection_id = %id, "Connection registered");
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Record a protocol state change. No-op once the entry is gone.
    pub fn update(&self, id: &ConnectionId, protocol: ProtocolState) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.protocol = protocol;
        }
    }

    fn remove(&self, id: &ConnectionId) {
        self.lock().remove(id);
        debug!(connection_id = %id, "Connection unregistered");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, ConnectionState>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps a connection's entry alive. Dropping it removes the entry.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
