//! Bookkeeping for open client connections.
//!
//! The accept loop registers each connection, the connection's own task
//! unregisters it when it finishes, and shutdown enumerates whatever is left
//! to warn and then force-close it. All three run concurrently, so the map is
//! kept behind a lock that is never held across an `.await`.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub type ConnectionId = u64;

/// Out-of-band messages the server pushes into a connection's task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Write this line to the client.
    Warn(String),
    /// Close the connection.
    Close,
}

#[derive(Debug, Error)]
#[error("connection {0} is already closed")]
pub struct ConnectionGone(pub ConnectionId);

/// Non-owning handle to a connection; the connection's task owns the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl ConnectionHandle {
    /// Creates a handle together with the receiver the connection task
    /// should listen on.
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, inbox) = mpsc::unbounded_channel();
        (Self { id, peer, notices }, inbox)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn warn(&self, message: impl Into<String>) -> Result<(), ConnectionGone> {
        self.notify(Notice::Warn(message.into()))
    }

    pub fn close(&self) -> Result<(), ConnectionGone> {
        self.notify(Notice::Close)
    }

    fn notify(&self, notice: Notice) -> Result<(), ConnectionGone> {
        self.notices
            .send(notice)
            .map_err(|_| ConnectionGone(self.id))
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<BTreeMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out identifiers 0, 1, 2, ... and never reuses one.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds `handle` under `id`. The returned guard unregisters it on drop,
    /// which also covers tasks that are aborted rather than finishing.
    pub fn register(self: &Arc<Self>, id: ConnectionId, handle: ConnectionHandle) -> Registration {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        debug!(id, "registered connection");
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            debug!(id, "unregistered connection");
        }
        removed
    }

    /// Calls `f` for every registered connection, in id order.
    ///
    /// `f` runs on a snapshot of the map, so it may register or unregister
    /// connections without deadlocking.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionId, &ConnectionHandle),
    {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for handle in &handles {
            f(handle.id, handle);
        }
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a connection registered for as long as it is alive.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<Registry>,
    id: ConnectionId,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
