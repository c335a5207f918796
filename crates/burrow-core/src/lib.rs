//! # burrow-core
//!
//! Foundation types for the Burrow REST-over-pub/sub tunnel.
//!
//! This crate holds the pieces every other Burrow crate agrees on:
//!
//! - **Frame codec**: [`frame`] encodes HTTP requests and responses into the
//!   length-prefixed binary payloads carried by broker messages
//! - **References**: [`reference::Reference`], the 31-bit correlation id
//! - **Topics**: [`topic`] builds and parses the per-device, per-reference
//!   topic names and matches wildcard filters
//! - **Errors**: [`errors`] covers the tunnel error taxonomy via `thiserror`
//! - **Backoff**: [`backoff::ReconnectPolicy`] for broker reconnect delays
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod backoff;
pub mod errors;
pub mod frame;
pub mod logging;
pub mod reference;
pub mod topic;

pub use errors::{FrameError, TopicError, TunnelError};
pub use frame::{HeaderMap, RequestFrame, ResponseFrame};
pub use reference::Reference;
