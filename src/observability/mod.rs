//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Listener, tasks, worker pool produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Admin status endpoint (see admin/)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection ID flows through every log line of a connection
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
