//! Account service: configuration-driven startup, broker messaging,
//! circuit breakers and an ordered, one-shot shutdown.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod messaging;
pub mod observability;
pub mod resilience;
pub mod storage;

pub use config::{BootstrapConfig, ConfigHolder, ConfigSnapshot};
pub use http::HttpServer;
pub use lifecycle::{start, Service, ShutdownCoordinator, StartupError, StartupOptions};
