//! Bootstrap configuration schema.
//!
//! These are the static knobs read once at process start from an optional
//! TOML file. Everything that the config server owns (ports, broker URL,
//! event bus name) lives in [`ConfigSnapshot`](crate::config::ConfigSnapshot)
//! instead. All types derive Serde traits and every section has defaults.

use serde::{Deserialize, Serialize};

/// Root bootstrap configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Service identity and HTTP surface settings.
    pub service: ServiceConfig,

    /// Remote config server client settings.
    pub config_server: ConfigServerConfig,

    /// Local store settings.
    pub storage: StorageConfig,

    /// Message broker connection settings.
    pub broker: BrokerConfig,

    /// Circuit breaker defaults and dependency list.
    pub breakers: BreakerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Shutdown settings.
    pub shutdown: ShutdownConfig,
}

/// Service identity and HTTP surface settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Host advertised in discovery tokens.
    pub advertise_host: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            advertise_host: "127.0.0.1".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Remote config server client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigServerConfig {
    /// Timeout for a single configuration fetch in seconds.
    pub fetch_timeout_secs: u64,

    /// Refresh exchange used when the snapshot has no `config_event_bus` key.
    pub default_event_bus: String,
}

impl Default for ConfigServerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 10,
            default_event_bus: "springCloudBus".to_string(),
        }
    }
}

/// Local store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the store file.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "accounts.db".to_string(),
        }
    }
}

/// Message broker connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Maximum connection attempts before giving up.
    pub connect_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Exchange carrying discovery and breaker health tokens.
    pub discovery_exchange: String,

    /// Interval between health heartbeats in seconds.
    pub heartbeat_secs: u64,

    /// Maximum time `close()` waits for handlers to drain, in milliseconds.
    pub drain_timeout_ms: u64,

    /// Time allowed for a single AMQP connection attempt, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 2000,
            discovery_exchange: "discovery".to_string(),
            heartbeat_secs: 30,
            drain_timeout_ms: 2000,
            connect_timeout_ms: 5000,
        }
    }
}

/// Circuit breaker defaults.
///
/// Per-dependency overrides come from the remote snapshot under
/// `hystrix.command.<name>.*`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Downstream dependencies that get a breaker.
    pub dependencies: Vec<String>,

    /// Call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Error percentage (1..=100) that opens the circuit.
    pub error_percent_threshold: u32,

    /// Minimum requests in the rolling window before the circuit may open.
    pub request_volume_threshold: u32,

    /// Time an open circuit waits before allowing a trial call, in milliseconds.
    pub sleep_window_ms: u64,

    /// Maximum concurrent calls through one breaker.
    pub max_concurrent_requests: usize,

    /// Length of the rolling statistics window in seconds.
    pub rolling_window_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            dependencies: vec!["imageservice".to_string(), "quotes-service".to_string()],
            timeout_ms: 1000,
            error_percent_threshold: 50,
            request_volume_threshold: 20,
            sleep_window_ms: 5000,
            max_concurrent_requests: 10,
            rolling_window_secs: 10,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// How often buffered spans are flushed to the trace collector, in milliseconds.
    pub trace_flush_ms: u64,

    /// Timeout for one span export request, in milliseconds.
    pub trace_export_timeout_ms: u64,

    /// Spans buffered for export before new ones are dropped.
    pub trace_queue_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            trace_flush_ms: 1000,
            trace_export_timeout_ms: 5000,
            trace_queue_capacity: 4096,
        }
    }
}

/// Shutdown settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound for each cleanup step in seconds.
    pub step_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 5,
        }
    }
}
