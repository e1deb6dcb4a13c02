//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! bootstrap TOML file (optional)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BootstrapConfig (static for the process lifetime)
//!
//! config server
//!     → loader.rs (fetch & merge property sources)
//!     → ConfigSnapshot (immutable)
//!     → ConfigHolder (shared handle)
//!
//! On refresh event:
//!     watcher.rs receives the bus message
//!     → loader.rs fetches a new snapshot
//!     → atomic swap inside ConfigHolder
//!     → readers observe the new snapshot on their next `current()`
//! ```
//!
//! # Design Decisions
//! - A snapshot is never mutated; refreshes replace it wholesale
//! - All bootstrap fields have defaults so the file is optional
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod snapshot;
pub mod validation;
pub mod watcher;

pub use loader::{load_configuration_from_branch, ConfigError, ConfigLoader};
pub use schema::BootstrapConfig;
pub use snapshot::{ConfigHolder, ConfigSnapshot, ConfigValue, ServiceIdentity, DEFAULT_SERVER_PORT};
pub use watcher::{ConfigChangeListener, RefreshEvent};
