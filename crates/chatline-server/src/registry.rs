use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use chatline_core::ids::{ConnectionId, UserId};

use crate::transport::{FrameSink, TransportError};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One open persistent connection.
///
/// Owned by the [`ConnectionRegistry`] once registered; the ingress task keeps
/// its own `Arc` for reading and lifecycle.
pub struct Connection {
    id: ConnectionId,
    user: Option<UserId>,
    sink: Mutex<Box<dyn FrameSink>>,
    registered: AtomicBool,
    closed: AtomicBool,
    last_pong: AtomicU64,
    connected_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(user: Option<UserId>, sink: Box<dyn FrameSink>, cancel: CancellationToken) -> Self {
        Self {
            id: ConnectionId::new(),
            user,
            sink: Mutex::new(sink),
            registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_pong: AtomicU64::new(now_secs()),
            connected_at: Utc::now(),
            cancel,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The authenticated user, if the connection was bound to one.
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancelled when the connection is closed, from whichever side.
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Write one text frame, giving up after `timeout`.
    pub async fn send_text(&self, text: &str, timeout: Duration) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send_text(text).await
        };
        tokio::time::timeout(timeout, write)
            .await
            .unwrap_or(Err(TransportError::WriteTimeout(timeout)))
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send_ping().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .unwrap_or(Err(TransportError::WriteTimeout(timeout)))
    }

    /// Release the transport. Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await;
        };
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, close).await;
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The set of currently open connections.
///
/// Membership changes only through [`register`](Self::register) and
/// [`deregister`](Self::deregister). Iteration works on a snapshot and
/// re-checks membership before each visit, so it tolerates concurrent
/// deregistration (including from inside the visitor) and never visits a
/// connection whose deregistration has already returned.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns false (and changes nothing) if it is already present.
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        match self.connections.entry(connection.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                connection.registered.store(true, Ordering::Release);
                slot.insert(connection);
                true
            }
        }
    }

    /// Remove a connection. Absent ids are a no-op and return `None`, so only
    /// one caller ever gets the removed connection back.
    pub fn deregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(id)?;
        connection.registered.store(false, Ordering::Release);
        Some(connection)
    }

    /// Deregister and release the transport. Returns true if this call was
    /// the one that removed the connection.
    pub async fn retire(&self, connection: &Connection) -> bool {
        let removed = self.deregister(connection.id()).is_some();
        connection.close().await;
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Copy of the current membership. No map locks are held once this returns.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Visit every registered connection once. No ordering guarantee.
    pub async fn for_each<F, Fut>(&self, mut visit: F)
    where
        F: FnMut(Arc<Connection>) -> Fut,
        Fut: Future<Output = ()>,
    {
        for connection in self.snapshot() {
            if connection.is_registered() {
                visit(connection).await;
            }
        }
    }

    /// Connections that have not answered a ping within `timeout`.
    pub fn unresponsive(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| entry.key().clone())
            .collect()
    }
}
