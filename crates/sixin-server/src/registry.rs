//! User ↔ live connection registry.
//!
//! One user may hold several connections (multiple tabs or devices, either
//! transport). Both directions of the mapping live behind a single lock so
//! they never disagree.

use sixin_core::{ServerEvent, TransportKind, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

pub type ConnectionId = u64;

/// Outbound queue depth per connection.
pub const OUTBOUND_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Cheap, cloneable sending side of a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub kind: TransportKind,
    pub tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiving end the transport writer drains.
    pub fn channel(id: ConnectionId, kind: TransportKind) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (Self { id, kind, tx }, rx)
    }
}

#[derive(Default)]
struct Inner {
    by_user: HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    by_conn: HashMap<ConnectionId, UserId>,
}

/// Concurrent-safe user ↔ connection mapping.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handle` to `user`. Re-registering the same connection is a no-op
    /// for the connection set; a connection can only belong to one user.
    pub async fn register(&self, user: UserId, handle: ConnectionHandle) {
        let conn_id = handle.id;
        let mut inner = self.inner.write().await;

        if let Some(previous) = inner.by_conn.insert(conn_id, user) {
            if previous != user {
                remove_conn(&mut inner.by_user, previous, conn_id);
            }
        }
        let conns = inner.by_user.entry(user).or_default();
        conns.insert(conn_id, handle);
        let live = conns.len();

        info!(user_id = user, conn_id, live, "connection registered");
    }

    /// Remove the binding. Safe to call for unknown or already-removed connections.
    pub async fn unregister(&self, user: UserId, conn_id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.by_conn.get(&conn_id) != Some(&user) {
            return false;
        }
        inner.by_conn.remove(&conn_id);
        remove_conn(&mut inner.by_user, user, conn_id);
        debug!(user_id = user, conn_id, "connection unregistered");
        true
    }

    /// Live connections for `user`. Empty when the user has none.
    pub async fn connections_for(&self, user: UserId) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(&user)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The authenticated user bound to `conn_id`, if registered.
    pub async fn user_for(&self, conn_id: ConnectionId) -> Option<UserId> {
        self.inner.read().await.by_conn.get(&conn_id).copied()
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        self.inner.read().await.by_user.contains_key(&user)
    }

    /// Number of live connections across all users.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.by_conn.len()
    }
}

fn remove_conn(
    by_user: &mut HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    user: UserId,
    conn_id: ConnectionId,
) {
    if let Some(conns) = by_user.get_mut(&user) {
        conns.remove(&conn_id);
        if conns.is_empty() {
            by_user.remove(&user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle(id: ConnectionId) -> ConnectionHandle {
        ConnectionHandle::channel(id, TransportKind::EventSocket).0
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let registry = SessionRegistry::new();
        registry.register(7, handle(1)).await;
        registry.register(7, handle(2)).await;

        assert_eq!(registry.connections_for(7).await.len(), 2);
        assert_eq!(registry.user_for(1).await, Some(7));
        assert!(registry.connections_for(8).await.is_empty());

        assert!(registry.unregister(7, 1).await);
        assert!(!registry.unregister(7, 1).await);
        assert_eq!(registry.user_for(1).await, None);
        assert!(registry.is_online(7).await);

        assert!(registry.unregister(7, 2).await);
        assert!(!registry.is_online(7).await);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_with_wrong_user_is_ignored() {
        let registry = SessionRegistry::new();
        registry.register(1, handle(10)).await;
        assert!(!registry.unregister(2, 10).await);
        assert_eq!(registry.user_for(10).await, Some(1));
    }

    #[tokio::test]
    async fn rebinding_moves_the_connection() {
        let registry = SessionRegistry::new();
        registry.register(1, handle(10)).await;
        registry.register(2, handle(10)).await;
        assert!(registry.connections_for(1).await.is_empty());
        assert_eq!(registry.user_for(10).await, Some(2));
    }

    #[tokio::test]
    async fn concurrent_register_and_unregister_stay_consistent() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..200u64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let user = i % 5;
                registry.register(user, handle(i)).await;
                if i % 2 == 0 {
                    registry.unregister(user, i).await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(registry.connection_count().await, 100);
        for user in 0..5 {
            for h in registry.connections_for(user).await {
                assert_eq!(registry.user_for(h.id).await, Some(user));
                assert_eq!(h.id % 2, 1);
            }
        }
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
    }
}
