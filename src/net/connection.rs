//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Own the socket and its buffered streams
//! - Enforce the lifecycle: Accepted → RequestActive ⇄ RequestKeepaliveWait
//!   → (DuplexActive)? → Closed
//! - Generate unique connection IDs for tracing
//! - Decide, after a request, whether to keep reading, suspend, or give up
//!
//! # Design Decisions
//! - A `Connection` is moved, never shared: the accept loop, the worker
//!   queue, one worker, or the poller holds it at any instant
//! - `close` is idempotent and the first caller's reason wins
//! - Diagnostics go through `LinkStatus`; nothing outside the owner mutates
//!   connection state

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::net::recycle::LinkBuffers;
use crate::net::registry::{ConnectionGuard, ConnectionRegistry, LinkStatus};
use crate::net::stream::{ReadStream, Readiness, WriteStream};
use crate::observability::metrics;
use crate::task::RequestState;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted, not yet serviced by a worker.
    Accepted = 0,
    /// A worker is processing a request.
    RequestActive = 1,
    /// Between requests, waiting for more input.
    RequestKeepaliveWait = 2,
    /// Upgraded to raw bidirectional streaming.
    DuplexActive = 3,
    /// Terminal.
    Closed = 4,
}

impl ConnectionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Accepted,
            1 => Self::RequestActive,
            2 => Self::RequestKeepaliveWait,
            3 => Self::DuplexActive,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::RequestActive => "request_active",
            Self::RequestKeepaliveWait => "request_keepalive_wait",
            Self::DuplexActive => "duplex_active",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The protocol finished with the connection.
    Completed,
    PeerClosed,
    IdleTimeout,
    /// A duplex handler made no progress.
    Stall,
    IoError,
    HandlerError,
    HandlerPanic,
    /// Rejected by the worker pool.
    ServerBusy,
    MaxRequests,
    Shutdown,
    /// Dropped or freed without an explicit close.
    Released,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PeerClosed => "peer_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::Stall => "stall",
            Self::IoError => "io_error",
            Self::HandlerError => "handler_error",
            Self::HandlerPanic => "handler_panic",
            Self::ServerBusy => "server_busy",
            Self::MaxRequests => "max_requests",
            Self::Shutdown => "shutdown",
            Self::Released => "released",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid connection transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// One accepted socket and everything needed to service it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    read_stream: ReadStream,
    write_stream: WriteStream,
    state: ConnectionState,
    accepted_at: Instant,
    last_activity: Instant,
    request_count: u64,
    idle_timeout: Option<Duration>,
    guard: ConnectionGuard,
}

impl Connection {
    /// Wrap an accepted socket. `read_timeout` bounds blocking reads inside a
    /// request; it is also applied to writes.
    pub fn new(
        socket: TcpStream,
        peer_addr: SocketAddr,
        buffers: LinkBuffers,
        write_capacity: usize,
        read_timeout: Duration,
        registry: &Arc<ConnectionRegistry>,
    ) -> io::Result<Self> {
        let timeout = read_timeout.max(Duration::from_millis(1));
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;

        let id = ConnectionId::new();
        let read_stream = ReadStream::new(socket.try_clone()?, buffers.read, timeout);
        let write_stream = WriteStream::new(socket.try_clone()?, buffers.write, write_capacity);
        let status = Arc::new(LinkStatus::new(id, peer_addr, socket));
        let now = Instant::now();

        Ok(Self {
            id,
            peer_addr,
            read_stream,
            write_stream,
            state: ConnectionState::Accepted,
            accepted_at: now,
            last_activity: now,
            request_count: 0,
            idle_timeout: None,
            guard: registry.track(status),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        if self.guard.status().is_closed() {
            ConnectionState::Closed
        } else {
            self.state
        }
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn status(&self) -> &Arc<LinkStatus> {
        self.guard.status()
    }

    pub fn read_stream(&mut self) -> &mut ReadStream {
        &mut self.read_stream
    }

    pub fn write_stream(&mut self) -> &mut WriteStream {
        &mut self.write_stream
    }

    /// Both streams at once, for handlers that copy input to output.
    pub fn streams(&mut self) -> (&mut ReadStream, &mut WriteStream) {
        (&mut self.read_stream, &mut self.write_stream)
    }

    /// Override the idle timeout used while waiting for input.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether the idle budget since the last activity is spent.
    pub fn idle_expired(&self, idle_timeout: Duration) -> bool {
        self.last_activity.elapsed() >= self.idle_timeout.unwrap_or(idle_timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed || self.guard.status().is_closed()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.guard.status().close_reason()
    }

    /// Begin (or resume) request processing.
    pub fn to_request_active(&mut self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Accepted
            | ConnectionState::RequestActive
            | ConnectionState::RequestKeepaliveWait => {
                self.set_state(ConnectionState::RequestActive);
                Ok(())
            }
            from => Err(ConnectionError::InvalidTransition {
                from,
                to: ConnectionState::RequestActive,
            }),
        }
    }

    /// Request done; the connection stays open for the next one.
    pub fn to_keepalive_wait(&mut self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::RequestActive | ConnectionState::RequestKeepaliveWait => {
                self.set_state(ConnectionState::RequestKeepaliveWait);
                Ok(())
            }
            from => Err(ConnectionError::InvalidTransition {
                from,
                to: ConnectionState::RequestKeepaliveWait,
            }),
        }
    }

    /// Switch to duplex mode. Idempotent; the upgrade is counted once.
    pub fn to_duplex_active(&mut self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::DuplexActive => Ok(()),
            ConnectionState::RequestActive | ConnectionState::RequestKeepaliveWait => {
                self.set_state(ConnectionState::DuplexActive);
                self.guard.status().add_upgrade();
                metrics::record_upgrade();
                tracing::debug!(connection_id = %self.id, "Connection upgraded to duplex");
                Ok(())
            }
            from => Err(ConnectionError::InvalidTransition {
                from,
                to: ConnectionState::DuplexActive,
            }),
        }
    }

    /// Count a completed request.
    pub fn finish_request(&mut self) {
        self.request_count += 1;
        self.guard.status().add_request();
        self.touch();
    }

    /// Close the connection. Flushes pending output, shuts the socket down
    /// and records `reason`. Returns `true` only for the call that closed it.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        let status = Arc::clone(self.guard.status());
        if !status.is_closed() && self.write_stream.pending() > 0 {
            if let Err(e) = std::io::Write::flush(&mut self.write_stream) {
                tracing::debug!(
                    connection_id = %self.id,
                    error = %e,
                    pending = self.write_stream.pending(),
                    "Flush on close failed"
                );
            }
        }
        self.state = ConnectionState::Closed;

        let closed = status.close(reason);
        if closed {
            tracing::debug!(
                connection_id = %self.id,
                peer = %self.peer_addr,
                reason = %reason,
                requests = self.request_count,
                "Connection closed"
            );
        }
        closed
    }

    /// Wait for the next unit of input.
    ///
    /// Blocks at most `min(thread_wait, remaining idle budget)`; a zero
    /// `thread_wait` never blocks. Returns `Suspend` when nothing arrived but
    /// the idle budget is not yet spent.
    pub fn process_keepalive(&mut self, thread_wait: Duration, idle_timeout: Duration) -> RequestState {
        if self.is_closed() {
            return RequestState::Exit;
        }
        if self.read_stream.available() > 0 {
            return RequestState::Request;
        }

        let idle_timeout = self.idle_timeout.unwrap_or(idle_timeout);
        let remaining = idle_timeout.saturating_sub(self.last_activity.elapsed());
        if remaining.is_zero() {
            self.close(CloseReason::IdleTimeout);
            return RequestState::Exit;
        }

        match self.read_stream.wait_for_data(thread_wait.min(remaining)) {
            Ok(Readiness::Data) => {
                self.touch();
                RequestState::Request
            }
            Ok(Readiness::Eof) => {
                self.close(CloseReason::PeerClosed);
                RequestState::Exit
            }
            Ok(Readiness::Idle) => {
                if self.last_activity.elapsed() >= idle_timeout {
                    tracing::debug!(connection_id = %self.id, "Connection idle timeout");
                    self.close(CloseReason::IdleTimeout);
                    RequestState::Exit
                } else {
                    RequestState::Suspend
                }
            }
            Err(e) => {
                if !self.is_closed() {
                    tracing::debug!(connection_id = %self.id, error = %e, "Keepalive read failed");
                }
                self.close(CloseReason::IoError);
                RequestState::Exit
            }
        }
    }

    /// Tear the connection down and hand back its buffers.
    pub fn into_buffers(mut self) -> LinkBuffers {
        self.close(CloseReason::Released);
        let Connection {
            read_stream,
            write_stream,
            guard,
            ..
        } = self;
        drop(guard);
        LinkBuffers {
            read: read_stream.into_buffer(),
            write: write_stream.into_buffer(),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.guard.status().set_state(state);
    }
}
