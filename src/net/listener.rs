//! TCP listener and accept loop.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections on a dedicated thread
//! - Schedule the first `ReadTask` with bounded retry
//! - Close with a "server busy" reply once retries are exhausted
//! - Graceful handling of accept errors

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::LinkConfig;
use crate::lifecycle::Shutdown;
use crate::net::connection::{CloseReason, Connection};
use crate::net::context::LinkContext;
use crate::observability::metrics;
use crate::protocol::Protocol;
use crate::task::{panic_message, LinkTask};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to start workers: {0}")]
    Start(#[source] io::Error),

    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),
}

/// Accepts connections and feeds them to the worker pool.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    tcp_nodelay: bool,
    ctx: Arc<LinkContext>,
    shutdown: Shutdown,
}

impl Listener {
    /// Bind, build the context, bootstrap workers and start the poller.
    pub fn bind(
        config: &LinkConfig,
        protocol: Arc<dyn Protocol>,
        shutdown: Shutdown,
    ) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .listener
            .bind_address
            .parse()
            .map_err(|_| ListenerError::InvalidAddress(config.listener.bind_address.clone()))?;

        let inner = TcpListener::bind(addr).map_err(ListenerError::Bind)?;
        let local_addr = inner.local_addr().map_err(ListenerError::Bind)?;

        let ctx = LinkContext::new(config, protocol);
        ctx.start().map_err(ListenerError::Start)?;

        tracing::info!(
            address = %local_addr,
            protocol = ctx.protocol().name(),
            min_threads = config.threads.min,
            max_threads = config.threads.max,
            "Listener bound"
        );

        Ok(Self {
            inner,
            local_addr,
            tcp_nodelay: config.listener.tcp_nodelay,
            ctx,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<LinkContext> {
        &self.ctx
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            shutdown: self.shutdown.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Accept loop. Returns once shutdown is triggered.
    pub fn run(&self) {
        let mut failures: u32 = 0;
        while !self.shutdown.is_triggered() {
            match self.accept() {
                Ok(mut conn) => {
                    failures = 0;
                    if self.shutdown.is_triggered() {
                        conn.close(CloseReason::Shutdown);
                        self.ctx.release(conn);
                        break;
                    }
                    self.dispatch(conn);
                }
                Err(e) => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                    let retry = self.ctx.settings().retry;
                    failures = failures.saturating_add(1);
                    let delay = retry.delay(failures.min(retry.attempts.max(1)));
                    tracing::warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "Accept failed");
                    thread::sleep(delay);
                }
            }
        }
        tracing::info!(address = %self.local_addr, "Accept loop stopped");
    }

    /// Block for the next connection and register it.
    pub fn accept(&self) -> Result<Box<Connection>, ListenerError> {
        let (socket, peer_addr) = self.inner.accept().map_err(ListenerError::Accept)?;
        if let Err(e) = socket.set_nodelay(self.tcp_nodelay) {
            tracing::debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let conn = self
            .ctx
            .allocate(socket, peer_addr)
            .map_err(ListenerError::Accept)?;
        metrics::record_accept();
        tracing::debug!(connection_id = %conn.id(), peer = %peer_addr, "Connection accepted");
        Ok(conn)
    }

    /// Schedule the first task for a connection. Returns `false` if the pool
    /// kept rejecting it and the connection was closed as busy.
    pub fn dispatch(&self, conn: Box<Connection>) -> bool {
        let retry = self.ctx.settings().retry;
        let mut task = LinkTask::read(conn, Arc::clone(&self.ctx));

        for attempt in 0..=retry.attempts {
            if attempt > 0 {
                thread::sleep(retry.delay(attempt));
            }
            match self.ctx.schedule(task) {
                Ok(()) => return true,
                Err(rejected) => {
                    task = rejected;
                    metrics::record_schedule_rejected();
                    if self.ctx.pool().is_shutdown() {
                        break;
                    }
                    tracing::warn!(
                        connection_id = %task.connection_id(),
                        attempt,
                        "Worker pool rejected connection"
                    );
                }
            }
        }

        let (mut conn, _, ctx) = task.into_parts();
        if ctx.pool().is_shutdown() {
            conn.close(CloseReason::Shutdown);
        } else {
            tracing::error!(
                connection_id = %conn.id(),
                peer = %conn.peer_addr(),
                attempts = retry.attempts + 1,
                "Failed to schedule connection, closing as busy"
            );
            let hook = panic::catch_unwind(AssertUnwindSafe(|| {
                ctx.protocol().on_busy(&mut conn);
            }));
            if let Err(panic) = hook {
                tracing::error!(
                    connection_id = %conn.id(),
                    peer = %conn.peer_addr(),
                    panic = panic_message(&*panic),
                    "Busy hook panicked"
                );
            }
            conn.close(CloseReason::ServerBusy);
        }
        ctx.release(conn);
        false
    }

    /// Stop workers and the poller. See `LinkContext::shutdown`.
    pub fn shutdown(&self, drain: Duration) -> bool {
        self.shutdown.trigger();
        self.ctx.shutdown(drain)
    }
}

/// Stops a running listener from another thread.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    shutdown: Shutdown,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// Trigger shutdown and wake the accept loop.
    pub fn stop(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        self.shutdown.trigger();

        // accept() has no timeout; a throwaway connection unblocks it.
        let mut wake = self.local_addr;
        if wake.ip().is_unspecified() {
            let loopback = match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            wake.set_ip(loopback);
        }
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            tracing::debug!(error = %e, "Accept loop wake-up connect failed");
        }
    }
}
