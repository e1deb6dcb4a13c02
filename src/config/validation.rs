//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds within bounds)
//! - Detect duplicate dependency names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BootstrapConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::BootstrapConfig;

/// A single semantic problem in the bootstrap configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("duplicate breaker dependency '{0}'")]
    DuplicateDependency(String),

    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),
}

/// Validate a bootstrap configuration, collecting every error found.
pub fn validate_config(config: &BootstrapConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let non_zero: [(&'static str, u64); 15] = [
        ("service.request_timeout_secs", config.service.request_timeout_secs),
        ("config_server.fetch_timeout_secs", config.config_server.fetch_timeout_secs),
        ("broker.connect_attempts", config.broker.connect_attempts as u64),
        ("broker.heartbeat_secs", config.broker.heartbeat_secs),
        ("broker.drain_timeout_ms", config.broker.drain_timeout_ms),
        ("broker.connect_timeout_ms", config.broker.connect_timeout_ms),
        ("breakers.timeout_ms", config.breakers.timeout_ms),
        ("breakers.request_volume_threshold", config.breakers.request_volume_threshold as u64),
        ("breakers.sleep_window_ms", config.breakers.sleep_window_ms),
        ("breakers.max_concurrent_requests", config.breakers.max_concurrent_requests as u64),
        ("breakers.rolling_window_secs", config.breakers.rolling_window_secs),
        ("shutdown.step_timeout_secs", config.shutdown.step_timeout_secs),
        ("observability.trace_flush_ms", config.observability.trace_flush_ms),
        ("observability.trace_export_timeout_ms", config.observability.trace_export_timeout_ms),
        ("observability.trace_queue_capacity", config.observability.trace_queue_capacity as u64),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    let percent = config.breakers.error_percent_threshold as u64;
    if !(1..=100).contains(&percent) {
        errors.push(ValidationError::OutOfRange {
            field: "breakers.error_percent_threshold",
            min: 1,
            max: 100,
            value: percent,
        });
    }

    if config.storage.path.trim().is_empty() {
        errors.push(ValidationError::Empty { field: "storage.path" });
    }
    if config.broker.discovery_exchange.trim().is_empty() {
        errors.push(ValidationError::Empty { field: "broker.discovery_exchange" });
    }

    let mut seen = HashSet::new();
    for name in &config.breakers.dependencies {
        if name.trim().is_empty() {
            errors.push(ValidationError::Empty { field: "breakers.dependencies" });
        } else if !seen.insert(name.as_str()) {
            errors.push(ValidationError::DuplicateDependency(name.clone()));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
