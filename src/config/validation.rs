//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, min <= max, buffer sizes)
//! - Validate addresses before anything binds
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: LinkConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::LinkConfig;

/// Smallest accepted stream buffer.
const MIN_BUFFER_SIZE: usize = 64;

/// A single semantic configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is not a valid socket address: {value}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("threads.max must be at least 1")]
    ZeroMaxThreads,
    #[error("threads.min ({min}) exceeds threads.max ({max})")]
    MinExceedsMax { min: usize, max: usize },
    #[error("threads.max_starting must be at least 1")]
    ZeroMaxStarting,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("{field} ({size}) is below the minimum of 64 bytes")]
    BufferTooSmall { field: &'static str, size: usize },
    #[error("listener.accept_retry_base_ms ({base}) exceeds listener.accept_retry_max_ms ({max})")]
    RetryDelayOrder { base: u64, max: u64 },
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &LinkConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }
    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
    }

    let threads = &config.threads;
    if threads.max == 0 {
        errors.push(ValidationError::ZeroMaxThreads);
    } else if threads.min > threads.max {
        errors.push(ValidationError::MinExceedsMax {
            min: threads.min,
            max: threads.max,
        });
    }
    if threads.max_starting == 0 {
        errors.push(ValidationError::ZeroMaxStarting);
    }

    let durations = [
        ("threads.idle_timeout_ms", threads.idle_timeout_ms),
        ("listener.request_read_timeout_ms", config.listener.request_read_timeout_ms),
        ("keepalive.timeout_ms", config.keepalive.timeout_ms),
        ("keepalive.poll_interval_ms", config.keepalive.poll_interval_ms),
        ("duplex.idle_timeout_ms", config.duplex.idle_timeout_ms),
    ];
    for (field, value) in durations {
        if value == 0 {
            errors.push(ValidationError::ZeroDuration(field));
        }
    }

    let buffers = [
        ("listener.read_buffer_size", config.listener.read_buffer_size),
        ("listener.write_buffer_size", config.listener.write_buffer_size),
    ];
    for (field, size) in buffers {
        if size < MIN_BUFFER_SIZE {
            errors.push(ValidationError::BufferTooSmall { field, size });
        }
    }

    if config.listener.accept_retry_base_ms > config.listener.accept_retry_max_ms {
        errors.push(ValidationError::RetryDelayOrder {
            base: config.listener.accept_retry_base_ms,
            max: config.listener.accept_retry_max_ms,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
