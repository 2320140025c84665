//! Live connection diagnostics.
//!
//! # Responsibilities
//! - Publish per-connection state for the admin endpoint
//! - Remember how the most recent connection ended
//! - Force-close every live socket on shutdown
//!
//! The registry never hands out a `Connection`. It holds `LinkStatus`, the
//! atomically updated shadow of one, plus a socket clone used only to shut
//! the socket down. Shutting a socket down unblocks whichever thread owns the
//! connection without touching its buffers.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::net::connection::{CloseReason, ConnectionId, ConnectionState};
use crate::observability::metrics;

/// Shared, read-mostly view of one connection.
#[derive(Debug)]
pub struct LinkStatus {
    id: ConnectionId,
    peer_addr: SocketAddr,
    accepted_at: Instant,
    state: AtomicU8,
    requests: AtomicU64,
    upgrades: AtomicU64,
    close_reason: Mutex<Option<CloseReason>>,
    socket: TcpStream,
}

impl LinkStatus {
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, socket: TcpStream) -> Self {
        Self {
            id,
            peer_addr,
            accepted_at: Instant::now(),
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            requests: AtomicU64::new(0),
            upgrades: AtomicU64::new(0),
            close_reason: Mutex::new(None),
            socket,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_upgrade(&self) {
        self.upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upgrades(&self) -> u64 {
        self.upgrades.load(Ordering::Relaxed)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.lock().is_some()
    }

    /// Record the close reason and shut the socket down. Only the first call
    /// has any effect; it returns `true`.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.set_state(ConnectionState::Closed);
        let _ = self.socket.shutdown(Shutdown::Both);
        metrics::record_close(reason);
        true
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.as_u64(),
            peer: self.peer_addr.to_string(),
            state: self.state(),
            requests: self.requests.load(Ordering::Relaxed),
            upgrades: self.upgrades(),
            age_ms: self.accepted_at.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub peer: String,
    pub state: ConnectionState,
    pub requests: u64,
    pub upgrades: u64,
    pub age_ms: u64,
}

/// How a connection ended.
#[derive(Debug, Clone, Serialize)]
pub struct CloseRecord {
    pub id: u64,
    pub peer: String,
    pub reason: CloseReason,
    pub requests: u64,
    pub lifetime_ms: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    live: DashMap<ConnectionId, Arc<LinkStatus>>,
    last_close: Mutex<Option<CloseRecord>>,
    closed_total: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. It stays listed until the guard is dropped.
    pub fn track(self: &Arc<Self>, status: Arc<LinkStatus>) -> ConnectionGuard {
        self.live.insert(status.id(), Arc::clone(&status));
        ConnectionGuard {
            status,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn closed_total(&self) -> u64 {
        self.closed_total.load(Ordering::Relaxed)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<LinkStatus>> {
        self.live.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut all: Vec<_> = self.live.iter().map(|entry| entry.snapshot()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn last_close(&self) -> Option<CloseRecord> {
        self.last_close.lock().clone()
    }

    /// Force-close every live connection. Returns how many were closed here.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let statuses: Vec<_> = self.live.iter().map(|e| Arc::clone(e.value())).collect();
        statuses.iter().filter(|s| s.close(reason)).count()
    }

    fn remove(&self, status: &LinkStatus) {
        self.live.remove(&status.id());
        self.closed_total.fetch_add(1, Ordering::Relaxed);

        let record = CloseRecord {
            id: status.id().as_u64(),
            peer: status.peer_addr.to_string(),
            reason: status.close_reason().unwrap_or(CloseReason::Released),
            requests: status.requests.load(Ordering::Relaxed),
            lifetime_ms: status.accepted_at.elapsed().as_millis() as u64,
        };
        *self.last_close.lock() = Some(record);
    }
}

/// Keeps a connection listed in the registry for its lifetime.
///
/// Dropping a connection that was never closed closes it as `Released`, so
/// every socket is shut down and every close is counted exactly once.
#[derive(Debug)]
pub struct ConnectionGuard {
    status: Arc<LinkStatus>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn status(&self) -> &Arc<LinkStatus> {
        &self.status
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.status.close(CloseReason::Released);
        self.registry.remove(&self.status);
        tracing::trace!(connection_id = %self.status.id(), "Connection deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn status() -> (Arc<LinkStatus>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (Arc::new(LinkStatus::new(ConnectionId::new(), peer, server)), client)
    }

    #[test]
    fn guard_lists_and_delists() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (status, _client) = status();
        let id = status.id();

        let guard = registry.track(Arc::clone(&status));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshots()[0].id, id.as_u64());

        drop(guard);
        assert!(registry.is_empty());
        assert_eq!(registry.closed_total(), 1);
        let record = registry.last_close().unwrap();
        assert_eq!(record.id, id.as_u64());
        assert_eq!(record.reason, CloseReason::Released);
    }

    #[test]
    fn close_all_shuts_sockets_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (status, mut client) = status();
        let _guard = registry.track(Arc::clone(&status));

        assert_eq!(registry.close_all(CloseReason::Shutdown), 1);
        assert_eq!(registry.close_all(CloseReason::Shutdown), 0);
        assert_eq!(status.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(status.state(), ConnectionState::Closed);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
