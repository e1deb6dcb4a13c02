//! HTTP surface.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, timeout + trace layers)
//!     → span middleware (metrics, exported span)
//!     → handler (health, breaker views, account lookup)
//! ```

pub mod server;

pub use server::{AppState, HttpServer};
