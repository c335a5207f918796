//! Error taxonomy for the tunnel.
//!
//! - [`FrameError`]: a payload could not be encoded or decoded
//! - [`TopicError`]: an inbound topic does not name a device and reference
//! - [`TunnelError`]: everything a proxied exchange can fail with
//!
//! Inbound-side failures (`MalformedFrame`, `BadTopic`, `UnknownReference`)
//! are logged and the message dropped. Caller-side failures
//! (`BrokerDisconnected`, `Timeout`, `ConnectionLost`) surface to the HTTP
//! client as gateway errors.

use std::time::Duration;

use thiserror::Error;

use crate::reference::Reference;

/// Frame encode/decode failure.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Fewer bytes remain than the next element needs.
    #[error("truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the next element requires.
        needed: usize,
        /// Bytes actually left in the buffer.
        remaining: usize,
    },
    /// A field is too long for the 24-bit length prefix.
    #[error("field of {len} bytes exceeds the 24-bit length limit")]
    FieldTooLarge {
        /// Length of the offending field.
        len: usize,
    },
    /// Bytes left over after a response body.
    #[error("{count} trailing bytes after response body")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },
    /// A text field is not valid UTF-8.
    #[error("{field} field is not valid UTF-8")]
    InvalidUtf8 {
        /// Which field failed.
        field: &'static str,
    },
    /// The header field is not a JSON object of string lists.
    #[error("invalid header JSON: {0}")]
    Headers(#[from] serde_json::Error),
}

/// Inbound topic does not have the expected shape.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    /// Wrong number of levels, wrong root, or wrong direction segment.
    #[error("unexpected topic layout: {0}")]
    Layout(String),
    /// The trailing reference token is not a valid reference.
    #[error("bad reference {reference:?} in topic {topic}")]
    BadReference {
        /// Full topic.
        topic: String,
        /// The token that failed to parse.
        reference: String,
    },
}

/// Failure of a tunnelled exchange.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Response payload could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// Inbound topic could not be parsed.
    #[error("bad topic: {0}")]
    BadTopic(#[from] TopicError),

    /// A response arrived for a reference nobody is waiting on.
    #[error("no pending request for reference {0}")]
    UnknownReference(Reference),

    /// No broker connection at publish time.
    #[error("broker is not connected")]
    BrokerDisconnected,

    /// No response arrived before the deadline.
    #[error("no response from device within {0:?}")]
    Timeout(Duration),

    /// The broker connection failed underneath an operation.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
}

impl TunnelError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::BadTopic(_) => "BAD_TOPIC",
            Self::UnknownReference(_) => "UNKNOWN_REFERENCE",
            Self::BrokerDisconnected => "BROKER_DISCONNECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::ConnectionLost(_) => "CONNECTION_LOST",
        }
    }

    /// Whether this error belongs to the inbound path, where the message is
    /// dropped rather than reported to a caller.
    #[must_use]
    pub fn is_discard(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::BadTopic(_) | Self::UnknownReference(_)
        )
    }
}
