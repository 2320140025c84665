//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define listener metrics (accepts, closes, requests, workers)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `link_connections_accepted_total` (counter)
//! - `link_connections_closed_total` (counter): by close reason
//! - `link_requests_total` (counter), `link_request_duration_seconds` (histogram)
//! - `link_duplex_upgrades_total`, `link_duplex_stalls_total` (counters)
//! - `link_schedule_rejections_total` (counter)
//! - `link_threads_active`, `link_threads_idle`, `link_threads_starting` (gauges)
//! - `link_parked_connections` (gauge)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use thiserror::Error;

use crate::net::connection::CloseReason;
use crate::pool::launcher::ThreadCounts;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid metrics address '{0}'")]
    InvalidAddress(String),

    #[error("failed to install metrics exporter: {0}")]
    Install(#[from] BuildError),
}

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from inside a tokio runtime context, or the exporter
/// starts its own background runtime.
pub fn init_metrics(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| MetricsError::InvalidAddress(address.to_string()))?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint started");
    Ok(())
}

pub fn record_accept() {
    counter!("link_connections_accepted_total").increment(1);
}

pub fn record_close(reason: CloseReason) {
    counter!("link_connections_closed_total", "reason" => reason.as_str()).increment(1);
}

pub fn record_request(start: Instant) {
    counter!("link_requests_total").increment(1);
    histogram!("link_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_upgrade() {
    counter!("link_duplex_upgrades_total").increment(1);
}

pub fn record_stall() {
    counter!("link_duplex_stalls_total").increment(1);
}

pub fn record_schedule_rejected() {
    counter!("link_schedule_rejections_total").increment(1);
}

pub fn record_thread_counts(counts: ThreadCounts) {
    gauge!("link_threads_active").set(counts.active as f64);
    gauge!("link_threads_idle").set(counts.idle as f64);
    gauge!("link_threads_starting").set(counts.starting as f64);
}

pub fn record_parked(parked: usize) {
    gauge!("link_parked_connections").set(parked as f64);
}
