//! # burrow-server
//!
//! The server side of the Burrow tunnel: HTTP requests come in, travel to
//! devices over a pub/sub broker, and the devices' answers come back.
//!
//! - Broker abstraction with an MQTT adapter and an in-process broker
//! - Connection manager: connect, subscribe, receive, reconnect with backoff
//! - Correlation registry matching upstream responses to pending requests
//! - Proxy handler mapping `/<device>/<rest>` onto the tunnel
//! - Optional session gate backed by an HTTP permission provider
//! - Health, Prometheus metrics, and graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broker;
pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tunnel;

pub use config::ServerConfig;
pub use server::{AppState, BurrowServer, ServerHandle};
pub use tunnel::CorrelationRegistry;
