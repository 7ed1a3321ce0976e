//! # tagbridge-server
//!
//! Bridges device WebSockets to the message bus.
//!
//! - [`registry`]: open sockets grouped by device tag, fan-out
//! - [`subscriptions`]: per-tag subscription refcounting, publish, broker callback
//! - [`session`]: one socket's lifecycle
//! - [`server`]: Axum router (`<endpoint>`, `/health`, `/metrics`) and listener
//! - [`shutdown`]: stop sequence shared by the listener and every session

#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod subscriptions;

pub use error::GatewayError;
pub use registry::ConnectionRegistry;
pub use server::GatewayServer;
pub use subscriptions::{SubscriptionManager, TopicDispatcher};
