//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via the `metrics` facade)
//!     → tracing.rs (span records for the trace collector)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Prometheus scrape endpoint (optional)
//!     → Zipkin-compatible collector (optional)
//! ```
//!
//! # Design Decisions
//! - Metric updates are no-ops until an exporter is installed
//! - The span exporter never fails startup; it degrades to disabled

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use self::tracing::{init_tracing, ExportOptions, SpanExporter, SpanRecord};
