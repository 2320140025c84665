//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the listener.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LinkConfig {
    /// Listener configuration (bind address, buffers, accept retry).
    pub listener: ListenerConfig,

    /// Elastic worker pool bounds.
    pub threads: ThreadConfig,

    /// Keepalive waiting and idle polling.
    pub keepalive: KeepaliveConfig,

    /// Upgraded (duplex) connection settings.
    pub duplex: DuplexConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin status endpoint.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Size of each connection's input buffer in bytes.
    pub read_buffer_size: usize,

    /// Size of each connection's output buffer in bytes.
    pub write_buffer_size: usize,

    /// Read timeout while a request is in progress, in milliseconds.
    pub request_read_timeout_ms: u64,

    /// Enable TCP_NODELAY on accepted sockets.
    pub tcp_nodelay: bool,

    /// Maximum number of connection buffers kept for reuse.
    pub connection_pool_size: usize,

    /// How many times a rejected connection is rescheduled before it is
    /// closed as busy.
    pub accept_retry_attempts: u32,

    /// Base delay for the reschedule backoff in milliseconds.
    pub accept_retry_base_ms: u64,

    /// Maximum delay for the reschedule backoff in milliseconds.
    pub accept_retry_max_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            read_buffer_size: 8 * 1024,
            write_buffer_size: 8 * 1024,
            request_read_timeout_ms: 30_000,
            tcp_nodelay: true,
            connection_pool_size: 256,
            accept_retry_attempts: 3,
            accept_retry_base_ms: 10,
            accept_retry_max_ms: 250,
        }
    }
}

/// Worker thread pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Workers kept alive even when idle.
    pub min: usize,

    /// Hard upper bound on live workers.
    pub max: usize,

    /// Maximum workers being spawned at the same time.
    pub max_starting: usize,

    /// How long an idle worker waits for work before it may retire.
    pub idle_timeout_ms: u64,

    /// Tasks allowed to wait in the queue when no worker can take them.
    pub queue_capacity: usize,

    /// Worker thread name prefix.
    pub name_prefix: String,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 64,
            max_starting: 4,
            idle_timeout_ms: 60_000,
            queue_capacity: 128,
            name_prefix: "link-worker".to_string(),
        }
    }
}

/// Keepalive configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// How long a worker blocks waiting for the next request before the
    /// connection is parked, in milliseconds.
    pub thread_timeout_ms: u64,

    /// Total idle time allowed between requests, in milliseconds.
    pub timeout_ms: u64,

    /// Requests served on one connection before it is closed (0 = unlimited).
    pub max_requests: u64,

    /// Interval at which parked connections are polled, in milliseconds.
    pub poll_interval_ms: u64,

    /// Maximum parked connections. Further idle connections are closed.
    pub max_parked: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            thread_timeout_ms: 1_000,
            timeout_ms: 15_000,
            max_requests: 0,
            poll_interval_ms: 20,
            max_parked: 4_096,
        }
    }
}

/// Duplex (upgraded) connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DuplexConfig {
    /// Idle time allowed on an upgraded connection, in milliseconds.
    pub idle_timeout_ms: u64,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin status endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin endpoint.
    pub enabled: bool,

    /// Admin endpoint bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
