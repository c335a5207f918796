//! Topic naming.
//!
//! ```text
//! server → device   devices/<deviceID>/tunnel-down/<reference>
//! device → server   devices/<deviceID>/tunnel-up/<reference>
//! ```
//!
//! The server subscribes to [`UPSTREAM_FILTER`]; each device subscribes to
//! its own [`downstream_filter`].

use crate::errors::TopicError;
use crate::reference::Reference;

/// First level of every tunnel topic.
pub const TOPIC_ROOT: &str = "devices";

/// Direction segment for requests.
pub const DOWNSTREAM: &str = "tunnel-down";

/// Direction segment for responses.
pub const UPSTREAM: &str = "tunnel-up";

/// Wildcard filter matching every device's responses.
pub const UPSTREAM_FILTER: &str = "devices/+/tunnel-up/+";

/// Topic for a request to `device_id`.
pub fn downstream_topic(device_id: &str, reference: Reference) -> String {
    format!("{TOPIC_ROOT}/{device_id}/{DOWNSTREAM}/{reference}")
}

/// Topic for a response from `device_id`.
pub fn upstream_topic(device_id: &str, reference: Reference) -> String {
    format!("{TOPIC_ROOT}/{device_id}/{UPSTREAM}/{reference}")
}

/// Filter a device subscribes to for its requests.
pub fn downstream_filter(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/{DOWNSTREAM}/+")
}

/// A parsed tunnel topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TunnelTopic<'a> {
    /// Device the message belongs to.
    pub device_id: &'a str,
    /// Correlation reference.
    pub reference: Reference,
}

/// Parse an upstream (`tunnel-up`) topic.
pub fn parse_upstream(topic: &str) -> Result<TunnelTopic<'_>, TopicError> {
    parse(topic, UPSTREAM)
}

/// Parse a downstream (`tunnel-down`) topic.
pub fn parse_downstream(topic: &str) -> Result<TunnelTopic<'_>, TopicError> {
    parse(topic, DOWNSTREAM)
}

fn parse<'a>(topic: &'a str, direction: &str) -> Result<TunnelTopic<'a>, TopicError> {
    let mut levels = topic.split('/');
    let (Some(root), Some(device_id), Some(dir), Some(token), None) = (
        levels.next(),
        levels.next(),
        levels.next(),
        levels.next(),
        levels.next(),
    ) else {
        return Err(TopicError::Layout(topic.to_owned()));
    };
    if root != TOPIC_ROOT || dir != direction || device_id.is_empty() {
        return Err(TopicError::Layout(topic.to_owned()));
    }
    let reference = Reference::parse(token).ok_or_else(|| TopicError::BadReference {
        topic: topic.to_owned(),
        reference: token.to_owned(),
    })?;
    Ok(TunnelTopic {
        device_id,
        reference,
    })
}

/// Whether `topic` matches an MQTT-style `filter` (`+` one level, `#` the
/// rest, including zero levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}
