//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Fetch config → Open store → Connect broker → Tracing → Breakers
//!     → Install shutdown coordinator → Serve
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Broadcast stop → Deregister breakers → Close broker
//!     → Close store → Exit 1
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → ShutdownCoordinator::initiate (first one wins)
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, listener last
//! - Cleanup runs at most once, guarded by a compare-and-swap
//! - Each cleanup step has a timeout; failures do not stop the sequence

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownCoordinator, ShutdownError, ShutdownReason, ShutdownState, EXIT_CODE};
pub use startup::{start, Service, StartupError, StartupOptions, APP_NAME};
