//! Registry of live connections

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::connection::{Connection, ConnectionId};
use crate::error::RegistryError;

/// The set of connections whose handler loop is still running.
///
/// The lock is only ever held for the map access itself. Callers that need to
/// do I/O take a `snapshot` first.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a fresh identifier for a connection about to be accepted
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    // Entries are independent, so a poisoned map is still valid.
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a connection
    pub fn add(&self, connection: Arc<Connection>) -> Result<ConnectionId, RegistryError> {
        let id = connection.id();
        let mut connections = self.lock();
        if connections.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        connections.insert(id, connection);
        debug!("Registered {} ({} live)", id, connections.len());
        Ok(id)
    }

    /// Unregister a connection; removing an absent id is a no-op
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.lock();
        let removed = connections.remove(&id);
        if removed.is_some() {
            debug!("Unregistered {} ({} live)", id, connections.len());
        }
        removed
    }

    /// Point-in-time copy of all registered connections
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Registered identifiers in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn make_connection(registry: &ConnectionRegistry) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let conn = Connection::new(registry.allocate_id(), stream, peer, 1024);
        (Arc::new(conn), client)
    }

    #[test]
    fn test_allocated_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
        assert_eq!(a.as_u64(), 1);
    }

    #[tokio::test]
    async fn test_add_and_snapshot() {
        let registry = ConnectionRegistry::new();
        let (c1, _k1) = make_connection(&registry).await;
        let (c2, _k2) = make_connection(&registry).await;

        let id1 = registry.add(Arc::clone(&c1)).unwrap();
        let id2 = registry.add(Arc::clone(&c2)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![id1, id2]);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let registry = ConnectionRegistry::new();
        let (c1, _k1) = make_connection(&registry).await;

        let id = registry.add(Arc::clone(&c1)).unwrap();
        assert_eq!(registry.add(c1), Err(RegistryError::Duplicate(id)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (c1, _k1) = make_connection(&registry).await;
        let id = registry.add(c1).unwrap();

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_from_registry() {
        let registry = ConnectionRegistry::new();
        let (c1, _k1) = make_connection(&registry).await;
        let id = registry.add(c1).unwrap();

        let snapshot = registry.snapshot();
        registry.remove(id);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), id);
        assert!(registry.snapshot().is_empty());
    }
}
