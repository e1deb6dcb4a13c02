//! Messaging subsystem.
//!
//! # Data Flow
//! ```text
//! connect_to_broker(url)
//!     → transport.rs (Transport::connect, retried with backoff)
//!     → client.rs (single live connection, swapped atomically)
//!
//! subscribe(exchange, kind, consumer, handler)
//!     → Connection::subscribe → delivery stream
//!     → one tokio task per subscription
//!     → handler.rs (MessageHandler::handle, in delivery order)
//!
//! close()
//!     → Connection::close (consumers dropped)
//!     → tasks drain buffered deliveries, bounded wait
//! ```
//!
//! # Design Decisions
//! - The wire protocol lives behind `Transport`; `amqp.rs` speaks AMQP to a
//!   real broker, `local.rs` is the in-process `memory://` implementation
//! - Subscriptions are remembered so a reconnect can restore them
//! - Handlers never return errors; they log and carry on

pub mod amqp;
pub mod client;
pub mod handler;
pub mod local;
pub mod transport;

pub use amqp::AmqpTransport;
pub use client::{ConnectOptions, MessagingClient};
pub use handler::MessageHandler;
pub use local::LocalBroker;
pub use transport::{Connection, Delivery, ExchangeType, MessagingError, Transport};
