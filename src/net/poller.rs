//! Idle connection poller.
//!
//! # Responsibilities
//! - Own suspended keepalive and duplex connections so they pin no worker
//! - Poll parked sockets without blocking every `poll_interval`
//! - Wake connections with input back into the worker pool
//! - Close connections that hang up or idle past their timeout
//!
//! # Data Flow
//! ```text
//! ReadTask / DuplexReadTask returns Suspend
//!     → LinkContext::park → parked list
//!     → poller tick: process_keepalive(0, idle timeout)
//!         Request → LinkTask::resume scheduled (re-parked if rejected)
//!         Suspend → stays parked
//!         Exit    → LinkContext::finish (release)
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::net::connection::{CloseReason, Connection};
use crate::net::context::LinkContext;
use crate::observability::metrics;
use crate::task::{DuplexController, LinkTask, RequestState};

/// A suspended connection and what to resume it with.
#[derive(Debug)]
pub struct Parked {
    pub conn: Box<Connection>,
    pub duplex: Option<DuplexController>,
    pub since: Instant,
}

impl Parked {
    pub fn new(conn: Box<Connection>, duplex: Option<DuplexController>) -> Self {
        Self {
            conn,
            duplex,
            since: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct KeepalivePoller {
    parked: Mutex<Vec<Parked>>,
    stopped: AtomicBool,
    sleep: Mutex<()>,
    wake: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl KeepalivePoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the polling thread. It holds the context weakly and exits once
    /// the context is gone or the poller is stopped.
    pub fn start(&self, ctx: Weak<LinkContext>) -> io::Result<()> {
        let handle = thread::Builder::new()
            .name("link-poller".into())
            .spawn(move || poll_loop(ctx))?;
        *self.handle.lock() = Some(handle);
        tracing::debug!("Keepalive poller started");
        Ok(())
    }

    /// Take ownership of a suspended connection. Hands it back when the
    /// poller is stopped or `max_parked` connections are already parked.
    pub fn park(&self, parked: Parked, max_parked: usize) -> Result<(), Parked> {
        let mut list = self.parked.lock();
        if self.stopped.load(Ordering::Acquire) || list.len() >= max_parked {
            return Err(parked);
        }
        list.push(parked);
        metrics::record_parked(list.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.parked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop polling and return every parked connection to the caller.
    pub fn stop(&self) -> Vec<Parked> {
        {
            let _list = self.parked.lock();
            self.stopped.store(true, Ordering::Release);
        }
        {
            let _sleep = self.sleep.lock();
            self.wake.notify_all();
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("Keepalive poller thread panicked");
            }
        }

        let drained: Vec<Parked> = self.parked.lock().drain(..).collect();
        metrics::record_parked(0);
        drained
    }

    /// One pass over every parked connection.
    fn tick(&self, ctx: &Arc<LinkContext>) {
        let parked = std::mem::take(&mut *self.parked.lock());
        if parked.is_empty() {
            return;
        }

        let settings = ctx.settings();
        let mut keep = Vec::with_capacity(parked.len());
        for Parked {
            mut conn,
            duplex,
            since,
        } in parked
        {
            let idle_timeout = if duplex.is_some() {
                settings.duplex_idle_timeout
            } else {
                settings.keepalive_timeout
            };

            match conn.process_keepalive(Duration::ZERO, idle_timeout) {
                RequestState::Request => {
                    let task = LinkTask::resume(conn, duplex, Arc::clone(ctx));
                    if let Err(task) = ctx.schedule(task) {
                        metrics::record_schedule_rejected();
                        tracing::debug!(
                            connection_id = %task.connection_id(),
                            "Worker pool saturated, connection stays parked"
                        );
                        let (conn, duplex, _) = task.into_parts();
                        keep.push(Parked {
                            conn,
                            duplex,
                            since,
                        });
                    }
                }
                RequestState::Suspend => keep.push(Parked {
                    conn,
                    duplex,
                    since,
                }),
                RequestState::Exit => ctx.finish(conn, duplex),
            }
        }

        let mut list = self.parked.lock();
        list.extend(keep);
        metrics::record_parked(list.len());
    }

    fn sleep(&self, interval: Duration) {
        let mut guard = self.sleep.lock();
        if !self.stopped.load(Ordering::Acquire) {
            self.wake.wait_for(&mut guard, interval);
        }
    }
}

fn poll_loop(ctx: Weak<LinkContext>) {
    while let Some(ctx) = ctx.upgrade() {
        let poller = ctx.poller();
        if poller.is_stopped() {
            break;
        }
        poller.tick(&ctx);
        poller.sleep(ctx.settings().poll_interval);
    }
    tracing::debug!("Keepalive poller stopped");
}

/// Close everything handed back by `stop`.
pub(crate) fn close_all(ctx: &LinkContext, parked: Vec<Parked>, reason: CloseReason) {
    for Parked { mut conn, duplex, .. } in parked {
        conn.close(reason);
        ctx.finish(conn, duplex);
    }
}
