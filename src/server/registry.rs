//! Live connection bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Opaque handle for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the server knows about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Scene owned by the connection, if any.
    pub scene: Option<u32>,
    /// When the connection was accepted.
    pub connected_at: Instant,
}

/// Connections keyed by [`ConnectionId`]. Ids are never reused.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionInfo>,
    next_id: u64,
}

/// Registry shared between the accept loop and connection tasks.
pub type SharedRegistry = Arc<Mutex<ConnectionRegistry>>;

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and return its handle.
    pub fn register(&mut self) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(id, ConnectionInfo { scene: None, connected_at: Instant::now() });
        id
    }

    /// Record the scene a connection owns.
    pub fn set_scene(&mut self, id: ConnectionId, scene: Option<u32>) {
        if let Some(info) = self.connections.get_mut(&id) {
            info.scene = scene;
        }
    }

    /// Remove a connection.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.remove(&id)
    }

    /// Look up a connection.
    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.get(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connection owning `scene`, if any.
    pub fn owner_of(&self, scene: u32) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|(_, info)| info.scene == Some(scene))
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let mut reg = ConnectionRegistry::new();
        let a = reg.register();
        let b = reg.register();
        assert!(b > a);
        reg.unregister(a);
        let c = reg.register();
        assert!(c > b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_scene_ownership() {
        let mut reg = ConnectionRegistry::new();
        let a = reg.register();
        reg.set_scene(a, Some(7));
        assert_eq!(reg.owner_of(7), Some(a));
        assert_eq!(reg.get(a).map(|i| i.scene), Some(Some(7)));
        reg.unregister(a);
        assert_eq!(reg.owner_of(7), None);
        assert!(reg.is_empty());
    }
}
