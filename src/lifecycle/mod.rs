//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger → accept loop exits → LinkContext::shutdown drains workers
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → ListenerHandle::stop
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, stop parking, reject queued, close, drain
//! - Shutdown has a timeout: workers still busy after the deadline are left
//!   to finish on their own

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
