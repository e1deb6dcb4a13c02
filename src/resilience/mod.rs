//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a downstream dependency:
//!     → registry.rs (look up the dependency's breaker)
//!     → circuit_breaker.rs (admit / fail fast, enforce timeout, count outcome)
//!
//! Health reporting:
//!     registry.rs → discovery exchange (UP, heartbeat, DOWN)
//!     discovery exchange → health.rs (cluster view)
//!
//! Broker connect:
//!     → backoff.rs (exponential delay with jitter between attempts)
//! ```
//!
//! # Design Decisions
//! - Breaker policy is fixed at startup; refreshes do not rebuild breakers
//! - The breaker itself never retries
//! - Deregistration must precede closing the broker connection

pub mod backoff;
pub mod circuit_breaker;
pub mod health;
pub mod registry;

pub use circuit_breaker::{BreakerHealth, BreakerSpec, CallError, CircuitBreaker, CircuitState};
pub use health::BreakerHealthHandler;
pub use registry::{CircuitBreakerRegistry, DiscoveryToken, HealthReporting, InstanceState};
