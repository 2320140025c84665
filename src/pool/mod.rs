//! Worker thread subsystem.
//!
//! # Data Flow
//! ```text
//! Listener / KeepalivePoller
//!     → worker.rs (WorkerPool::schedule, bounded FIFO queue)
//!     → launcher.rs (grow within [min, max], throttled by max_starting)
//!     → worker thread runs the task, then waits for more or retires
//! ```
//!
//! # Design Decisions
//! - Plain OS threads; the core does no async I/O
//! - A rejected task is handed back to the caller, never dropped
//! - Counter updates and spawn decisions share one lock

pub mod launcher;
pub mod worker;

pub use launcher::{BusyGuard, ThreadCounts, ThreadLauncher, ThreadLimits};
pub use worker::{Task, WorkerPool};
