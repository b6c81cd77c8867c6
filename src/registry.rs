// In-flight connection bookkeeping
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::JoinHandle;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Socks5,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Socks5 => f.write_str("SOCKS5"),
        }
    }
}

/// One accepted client connection. The task behind `task` owns the client
/// socket and any upstream socket; once it has been aborted and joined, both
/// are closed.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub protocol: Protocol,
    pub created_at: Instant,
    task: JoinHandle<()>,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, peer: SocketAddr, protocol: Protocol, task: JoinHandle<()>) -> Self {
        ConnectionRecord {
            id,
            peer,
            protocol,
            created_at: Instant::now(),
            task,
        }
    }

    /// Aborts the owning task and waits until it has been dropped, so the
    /// sockets are closed when this returns.
    pub async fn close(self) {
        self.task.abort();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::debug!("Connection #{} handler panicked before close", self.id);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Tracks a record. A previous record under the same id is replaced and
    /// returned.
    pub fn add(&self, record: ConnectionRecord) -> Option<ConnectionRecord> {
        self.lock().insert(record.id, record)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.lock().remove(&id)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Empties the registry and closes every connection it tracked. Returns
    /// once all of their sockets are closed, with how many there were.
    pub async fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let closed = drained.len();

        // Abort everything first so the tasks wind down in parallel.
        for record in drained.values() {
            tracing::debug!(
                "Force-closing {} connection #{} from {}",
                record.protocol,
                record.id,
                record.peer
            );
            record.task.abort();
        }
        for record in drained.into_values() {
            record.close().await;
        }
        closed
    }

    /// Spawns `handler` as the task owning a freshly accepted connection and
    /// tracks it until the task ends, whether it finishes, panics or is
    /// aborted.
    pub fn spawn_tracked<F>(self: &Arc<Self>, peer: SocketAddr, protocol: Protocol, handler: F) -> ConnectionId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let registry = Arc::clone(self);

        // The lock is held across spawn so the task cannot untrack itself
        // before it has been tracked.
        let mut connections = self.lock();
        let handle = tokio::spawn(async move {
            let _untrack = Untrack { registry, id };
            handler.await;
        });
        connections.insert(id, ConnectionRecord::new(id, peer, protocol, handle));
        id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionRecord>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Untrack {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
