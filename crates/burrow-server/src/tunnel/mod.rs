//! The request/response tunnel: correlation of in-flight requests and the
//! HTTP handler that feeds them.

pub mod proxy;
pub mod registry;

pub use proxy::{ProxyError, canonical_header_name};
pub use registry::{CorrelationRegistry, Registration};
