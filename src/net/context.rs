//! Shared state for one listener and every task it spawns.
//!
//! # Responsibilities
//! - Bundle the protocol, worker pool, recycle pool, registry and poller
//! - Hold hot-swappable runtime settings
//! - Route connections to their next owner: pool, poller or recycle pool
//! - Produce read-only diagnostics
//!
//! # Design Decisions
//! - Passed explicitly as `Arc<LinkContext>`; there is no global state
//! - Settings are read per task through `ArcSwap`, so a reload takes effect
//!   on the next unit of work without locking

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::LinkConfig;
use crate::net::connection::{CloseReason, Connection};
use crate::net::poller::{self, KeepalivePoller, Parked};
use crate::net::recycle::{ConnectionPool, RecycleStats};
use crate::net::registry::{CloseRecord, ConnectionRegistry};
use crate::pool::{ThreadCounts, ThreadLauncher, ThreadLimits, WorkerPool};
use crate::protocol::Protocol;
use crate::resilience::backoff::RetryPolicy;
use crate::task::{DuplexController, LinkTask};

/// Runtime settings that may change on reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub request_read_timeout: Duration,
    pub keepalive_thread_timeout: Duration,
    pub keepalive_timeout: Duration,
    /// 0 means unlimited.
    pub keepalive_max_requests: u64,
    pub poll_interval: Duration,
    pub max_parked: usize,
    pub duplex_idle_timeout: Duration,
    pub retry: RetryPolicy,
}

impl LinkSettings {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            request_read_timeout: Duration::from_millis(config.listener.request_read_timeout_ms),
            keepalive_thread_timeout: Duration::from_millis(config.keepalive.thread_timeout_ms),
            keepalive_timeout: Duration::from_millis(config.keepalive.timeout_ms),
            keepalive_max_requests: config.keepalive.max_requests,
            poll_interval: Duration::from_millis(config.keepalive.poll_interval_ms.max(1)),
            max_parked: config.keepalive.max_parked,
            duplex_idle_timeout: Duration::from_millis(config.duplex.idle_timeout_ms),
            retry: RetryPolicy::from_config(&config.listener),
        }
    }
}

/// Point-in-time view for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub protocol: &'static str,
    pub threads: ThreadCounts,
    pub limits: ThreadLimits,
    pub queued: usize,
    pub parked: usize,
    pub live_connections: usize,
    pub closed_connections: u64,
    pub recycle: RecycleStats,
    pub last_close: Option<CloseRecord>,
}

pub struct LinkContext {
    protocol: Arc<dyn Protocol>,
    pool: WorkerPool<LinkTask>,
    connections: ConnectionPool,
    registry: Arc<ConnectionRegistry>,
    poller: KeepalivePoller,
    settings: ArcSwap<LinkSettings>,
}

impl LinkContext {
    pub fn new(config: &LinkConfig, protocol: Arc<dyn Protocol>) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            pool: WorkerPool::new(&config.threads),
            connections: ConnectionPool::new(&config.listener),
            registry: Arc::new(ConnectionRegistry::new()),
            poller: KeepalivePoller::new(),
            settings: ArcSwap::from_pointee(LinkSettings::from_config(config)),
        })
    }

    /// Bootstrap the minimum workers and start the poller thread.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        self.pool.start();
        self.poller.start(Arc::downgrade(self))
    }

    pub fn settings(&self) -> Arc<LinkSettings> {
        self.settings.load_full()
    }

    /// Apply a reloaded configuration. The bind address and buffer sizes
    /// stay as they were at startup.
    pub fn apply_config(&self, config: &LinkConfig) {
        self.pool.reconfigure(&config.threads);
        self.settings
            .store(Arc::new(LinkSettings::from_config(config)));
        tracing::info!(
            min_threads = config.threads.min,
            max_threads = config.threads.max,
            keepalive_timeout_ms = config.keepalive.timeout_ms,
            "Runtime settings reloaded"
        );
    }

    pub fn protocol(&self) -> &dyn Protocol {
        self.protocol.as_ref()
    }

    pub fn pool(&self) -> &WorkerPool<LinkTask> {
        &self.pool
    }

    pub fn launcher(&self) -> &ThreadLauncher {
        self.pool.launcher()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionPool {
        &self.connections
    }

    pub fn poller(&self) -> &KeepalivePoller {
        &self.poller
    }

    /// Wrap an accepted socket in a registered connection.
    pub fn allocate(&self, socket: TcpStream, peer_addr: SocketAddr) -> io::Result<Box<Connection>> {
        let timeout = self.settings.load().request_read_timeout;
        self.connections
            .allocate(socket, peer_addr, timeout, &self.registry)
    }

    pub fn schedule(&self, task: LinkTask) -> Result<(), LinkTask> {
        self.pool.schedule(task)
    }

    /// Return a finished connection to the recycle pool.
    pub fn release(&self, conn: Box<Connection>) {
        self.connections.free(conn);
    }

    /// End a duplex session if there is one, then release.
    pub fn finish(&self, mut conn: Box<Connection>, duplex: Option<DuplexController>) {
        if let Some(mut controller) = duplex {
            controller.complete(&mut conn);
        }
        self.release(conn);
    }

    /// Hand a suspended connection to the poller. If it cannot take one more,
    /// the connection is closed instead of pinning a worker.
    pub fn park(&self, conn: Box<Connection>, duplex: Option<DuplexController>) {
        let max_parked = self.settings.load().max_parked;
        if let Err(Parked {
            mut conn, duplex, ..
        }) = self.poller.park(Parked::new(conn, duplex), max_parked)
        {
            let reason = if self.poller.is_stopped() {
                CloseReason::Shutdown
            } else {
                tracing::warn!(
                    connection_id = %conn.id(),
                    max_parked,
                    "Poller full, closing idle connection"
                );
                CloseReason::ServerBusy
            };
            conn.close(reason);
            self.finish(conn, duplex);
        }
    }

    pub fn report(&self) -> LinkReport {
        LinkReport {
            protocol: self.protocol.name(),
            threads: self.launcher().counts(),
            limits: self.launcher().limits(),
            queued: self.pool.queued(),
            parked: self.poller.len(),
            live_connections: self.registry.len(),
            closed_connections: self.registry.closed_total(),
            recycle: self.connections.stats(),
            last_close: self.registry.last_close(),
        }
    }

    /// Stop parking, reject queued work, force-close live sockets, then wait
    /// up to `drain` for workers to exit. Returns `true` if they all did.
    pub fn shutdown(&self, drain: Duration) -> bool {
        let parked = self.poller.stop();
        let parked_count = parked.len();
        poller::close_all(self, parked, CloseReason::Shutdown);

        self.pool.shutdown();
        let forced = self.registry.close_all(CloseReason::Shutdown);

        let drained = self.pool.await_termination(drain);
        tracing::info!(
            parked = parked_count,
            forced,
            drained,
            "Link context shut down"
        );
        if !drained {
            tracing::warn!(
                remaining = self.launcher().counts().total(),
                "Workers still running after drain timeout"
            );
        }
        drained
    }
}
