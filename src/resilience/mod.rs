//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Pool rejects a freshly accepted connection:
//!     → backoff.rs (bounded exponential delay)
//!     → reschedule, or close as "server busy" once attempts run out
//! ```
//!
//! # Design Decisions
//! - Rejection is backpressure, never a silent drop
//! - Retries are bounded so the accept loop keeps moving

pub mod backoff;
