//! Elastic worker-pool controller.
//!
//! # Responsibilities
//! - Track active, idle and starting worker counts
//! - Decide when a new worker may be spawned, within `[min, max]`
//! - Throttle concurrent spawns so a burst cannot stampede thread creation
//! - Decide when an idle worker may retire
//!
//! # Design Decisions
//! - Counts and limits live under one mutex, so every check-then-act is atomic
//! - `active + idle + starting` is the live worker total and never exceeds `max`
//! - Busy periods are bracketed by an RAII guard so a panicking task cannot
//!   leave the counters skewed

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ThreadConfig;
use crate::observability::metrics;

/// Snapshot of the worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadCounts {
    pub active: usize,
    pub idle: usize,
    pub starting: usize,
}

impl ThreadCounts {
    /// Live workers, including ones still being spawned.
    pub fn total(&self) -> usize {
        self.active + self.idle + self.starting
    }
}

/// Pool bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadLimits {
    pub min: usize,
    pub max: usize,
    pub max_starting: usize,
}

impl ThreadLimits {
    pub fn from_config(config: &ThreadConfig) -> Self {
        Self {
            min: config.min,
            max: config.max.max(1),
            max_starting: config.max_starting.max(1),
        }
    }
}

#[derive(Debug)]
struct LauncherState {
    counts: ThreadCounts,
    limits: ThreadLimits,
}

/// Bounds and right-sizes the worker pool.
#[derive(Debug)]
pub struct ThreadLauncher {
    state: Mutex<LauncherState>,
    next_id: AtomicU64,
}

impl ThreadLauncher {
    pub fn new(limits: ThreadLimits) -> Self {
        Self {
            state: Mutex::new(LauncherState {
                counts: ThreadCounts::default(),
                limits,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn counts(&self) -> ThreadCounts {
        self.state.lock().counts
    }

    pub fn limits(&self) -> ThreadLimits {
        self.state.lock().limits
    }

    /// Replace the pool bounds. Existing workers above a lowered `max` are
    /// not interrupted; they retire as they go idle.
    pub fn set_limits(&self, limits: ThreadLimits) {
        let mut state = self.state.lock();
        if state.limits != limits {
            tracing::info!(
                min = limits.min,
                max = limits.max,
                max_starting = limits.max_starting,
                "Worker limits updated"
            );
        }
        state.limits = limits;
    }

    /// Start a new worker if the pool has room for one.
    ///
    /// Returns `false` when the pool is at `max`, when `max_starting` spawns
    /// are already in flight, or when `spawn` itself fails. In the last case
    /// the failure is logged and the reservation rolled back; whatever work
    /// prompted the launch stays queued for an existing worker.
    pub fn launch_child_thread<F>(&self, spawn: F) -> bool
    where
        F: FnOnce(u64) -> io::Result<()>,
    {
        if !self.try_reserve_start(true) {
            return false;
        }
        self.spawn_reserved(spawn)
    }

    /// Bootstrap workers until `max(min, 1)` are live. The spawn throttle does
    /// not apply here. Returns how many workers were started.
    pub fn start_worker_thread<F>(&self, mut spawn: F) -> usize
    where
        F: FnMut(u64) -> io::Result<()>,
    {
        let mut started = 0;
        loop {
            let wanted = {
                let state = self.state.lock();
                state.limits.min.max(1)
            };
            if self.counts().total() >= wanted || !self.try_reserve_start(false) {
                break;
            }
            if !self.spawn_reserved(&mut spawn) {
                break;
            }
            started += 1;
        }
        started
    }

    /// Reserve a `starting` slot. Used by the scheduler while it holds its
    /// queue lock, so the decision and the enqueue are one step.
    pub(crate) fn try_reserve_start(&self, throttled: bool) -> bool {
        let mut state = self.state.lock();
        let LauncherState { counts, limits } = &mut *state;
        if counts.total() >= limits.max {
            return false;
        }
        if throttled && counts.starting >= limits.max_starting {
            return false;
        }
        counts.starting += 1;
        metrics::record_thread_counts(*counts);
        true
    }

    /// Spawn into a slot taken with `try_reserve_start`.
    pub(crate) fn spawn_reserved<F>(&self, spawn: F) -> bool
    where
        F: FnOnce(u64) -> io::Result<()>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match spawn(id) {
            Ok(()) => true,
            Err(e) => {
                self.update(|counts| counts.starting = counts.starting.saturating_sub(1));
                tracing::error!(thread_id = id, error = %e, "Worker thread spawn failed");
                false
            }
        }
    }

    /// A freshly spawned worker is ready for work.
    pub fn on_child_thread_begin(&self) {
        self.update(|counts| {
            counts.starting = counts.starting.saturating_sub(1);
            counts.idle += 1;
        });
    }

    /// A worker picked up a task. The guard moves it back to idle on drop.
    pub fn on_child_thread_resume(&self) -> BusyGuard<'_> {
        self.update(|counts| {
            counts.idle = counts.idle.saturating_sub(1);
            counts.active += 1;
        });
        BusyGuard { launcher: self }
    }

    /// A worker finished its task.
    pub fn on_child_thread_end(&self) {
        self.update(|counts| {
            counts.active = counts.active.saturating_sub(1);
            counts.idle += 1;
        });
    }

    /// An idle worker timed out waiting. It may exit only while the pool is
    /// above `min`; on `true` it has already been removed from the counts.
    pub fn try_retire(&self) -> bool {
        let mut state = self.state.lock();
        let LauncherState { counts, limits } = &mut *state;
        if counts.idle == 0 || counts.total() <= limits.min {
            return false;
        }
        counts.idle -= 1;
        metrics::record_thread_counts(*counts);
        true
    }

    /// An idle worker is exiting (shutdown).
    pub fn on_child_thread_exit(&self) {
        self.update(|counts| counts.idle = counts.idle.saturating_sub(1));
    }

    fn update(&self, f: impl FnOnce(&mut ThreadCounts)) {
        let mut state = self.state.lock();
        f(&mut state.counts);
        metrics::record_thread_counts(state.counts);
    }
}

/// Marks a worker busy for as long as it lives.
#[must_use = "dropping the guard immediately ends the busy period"]
pub struct BusyGuard<'a> {
    launcher: &'a ThreadLauncher,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.launcher.on_child_thread_end();
    }
}
