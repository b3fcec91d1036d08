//! Thread-safe set of live connections, used for bulk shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

/// The shareable side of a connection: identity plus its close signal.
///
/// The stream itself is owned by the task serving the connection. Closing
/// the handle makes every pending and future I/O on that stream fail with
/// an aborted error, after which the task drops the stream.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    remote: Option<SocketAddr>,
    closed: watch::Sender<bool>,
}

impl ConnectionHandle {
    fn new(id: u64, remote: Option<SocketAddr>) -> Self {
        Self {
            id,
            remote,
            closed: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Signals the owning task to close the transport. Idempotent and safe
    /// to call from any thread.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Every open connection, keyed by id.
///
/// Insert, erase and the snapshot-and-close of [`close_all`] share one
/// mutex.
///
/// [`close_all`]: ConnectionRegistry::close_all
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<ConnectionHandle>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a new connection. It stays registered until the returned
    /// [`Registration`] is dropped or the registry is cleared.
    pub fn register(self: &Arc<Self>, remote: Option<SocketAddr>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle::new(id, remote));
        self.lock().insert(id, Arc::clone(&handle));
        Registration {
            registry: Arc::clone(self),
            handle,
        }
    }

    /// Removes a connection. Returns `false` if it was not registered.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    /// Closes every registered connection and empties the registry.
    /// Returns how many connections were closed.
    pub fn close_all(&self) -> usize {
        let mut connections = self.lock();
        for handle in connections.values() {
            handle.close();
        }
        let closed = connections.len();
        connections.clear();
        debug!(closed, "closed all registered connections");
        closed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Membership of one connection in a [`ConnectionRegistry`]; removes the
/// entry when dropped.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    handle: Arc<ConnectionHandle>,
}

impl Registration {
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.handle.id);
    }
}
