//! Live agent connections, keyed by connection id and routing identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionStatus};
use crate::protocol::ConnectionId;

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_identity: HashMap<String, ConnectionId>,
}

/// Registry of connected agents.
///
/// All mutation goes through one write lock; lookups share a read lock.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    next_seq: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    ///
    /// A requested identity already held by another connection gets a `-1`,
    /// `-2`, ... suffix; the existing holder is never evicted.
    pub fn register(
        &self,
        frame_tx: mpsc::Sender<Vec<u8>>,
        requested_identity: Option<&str>,
    ) -> Arc<Connection> {
        let id = ConnectionId::generate();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let base = requested_identity.and_then(normalize_identity);

        let mut inner = self.write();
        let identity = base.map(|base| {
            let mut candidate = base.clone();
            let mut suffix = 1u32;
            while inner.by_identity.contains_key(&candidate) {
                candidate = format!("{base}-{suffix}");
                suffix += 1;
            }
            candidate
        });

        let conn = Arc::new(Connection::new(id.clone(), identity.clone(), frame_tx, seq));
        if let Some(identity) = identity {
            inner.by_identity.insert(identity, id.clone());
        }
        inner.by_id.insert(id, Arc::clone(&conn));
        drop(inner);

        log::info!(
            "[Registry] Registered {} as {}",
            conn.id(),
            conn.identity().unwrap_or("<no identity>")
        );
        conn
    }

    /// Connection currently holding `identity`, unless it is closed.
    pub fn lookup(&self, identity: &str) -> Option<Arc<Connection>> {
        let inner = self.read();
        let id = inner.by_identity.get(identity)?;
        inner
            .by_id
            .get(id)
            .filter(|c| c.status() != ConnectionStatus::Closed)
            .cloned()
    }

    /// Most recently registered active connection.
    pub fn lookup_any(&self) -> Option<Arc<Connection>> {
        self.read()
            .by_id
            .values()
            .filter(|c| c.status() == ConnectionStatus::Active)
            .max_by_key(|c| c.registered_seq())
            .cloned()
    }

    /// Connection by id.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.read().by_id.get(id).cloned()
    }

    /// Remove a connection. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.write();
        let conn = inner.by_id.remove(id)?;
        if let Some(identity) = conn.identity() {
            // Only drop the mapping if it still points at this connection.
            if inner.by_identity.get(identity) == Some(id) {
                inner.by_identity.remove(identity);
            }
        }
        drop(inner);
        log::debug!("[Registry] Removed {id}");
        Some(conn)
    }

    /// All registered connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.read().by_id.values().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Whether no agent is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Normalize a requested identity into a DNS-label-safe form.
///
/// Lowercases, drops everything but ASCII alphanumerics and `-`, and trims
/// leading/trailing dashes. Returns `None` when nothing is left.
pub fn normalize_identity(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let trimmed = cleaned.trim_matches('-');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
