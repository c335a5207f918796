//! Device permissions and the provider that looks them up.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use thiserror::Error;
use tracing::debug;

bitflags! {
    /// What a token may do to a device.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Safe methods (`GET`, `HEAD`, `OPTIONS`).
        const READ = 1;
        /// Everything else.
        const WRITE = 1 << 1;
    }
}

impl Capabilities {
    /// Capability an HTTP method requires.
    pub fn required_for(method: &str) -> Self {
        match method {
            "GET" | "HEAD" | "OPTIONS" => Self::READ,
            _ => Self::WRITE,
        }
    }
}

/// Per-device capability map granted to one token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Permissions(HashMap<String, Capabilities>);

impl Permissions {
    /// Build from raw bitmasks; unknown bits are ignored.
    pub fn from_bits(raw: HashMap<String, u32>) -> Self {
        Self(
            raw.into_iter()
                .map(|(device, bits)| (device, Capabilities::from_bits_truncate(bits)))
                .collect(),
        )
    }

    /// Grant `caps` on `device_id`, adding to any existing grant.
    #[must_use]
    pub fn with(mut self, device_id: &str, caps: Capabilities) -> Self {
        *self.0.entry(device_id.to_string()).or_default() |= caps;
        self
    }

    /// Whether every bit of `required` is granted on `device_id`.
    pub fn allows(&self, device_id: &str, required: Capabilities) -> bool {
        self.0
            .get(device_id)
            .is_some_and(|granted| granted.contains(required))
    }

    /// Number of devices with any grant.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no device is granted anything.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Permission lookup failure.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The provider does not accept the token.
    #[error("token rejected by auth provider (status {0})")]
    Rejected(u16),
    /// The provider could not be reached or failed.
    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with something other than a permission map.
    #[error("invalid auth provider response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "TOKEN_REJECTED",
            Self::Unavailable(_) => "AUTH_UNAVAILABLE",
            Self::InvalidResponse(_) => "AUTH_INVALID_RESPONSE",
        }
    }
}

/// Exchanges a bearer token for a permission map.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Look up the permissions granted to `token`.
    async fn authorize(&self, token: &str) -> Result<Permissions, AuthError>;
}

/// Looks permissions up with `GET <url>` and `Authorization: Bearer <token>`.
///
/// The endpoint answers `200` with `{"<deviceId>": <bits>, ...}`; `401` or
/// `403` reject the token.
#[derive(Clone, Debug)]
pub struct HttpAuthProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthProvider {
    /// Create a provider for `url` with a per-lookup `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn authorize(&self, token: &str) -> Result<Permissions, AuthError> {
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::Rejected(status.as_u16()));
        }
        if !status.is_success() {
            return Err(AuthError::Unavailable(format!("status {status}")));
        }

        let raw: HashMap<String, u32> = resp
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        debug!(devices = raw.len(), "fetched permissions");
        Ok(Permissions::from_bits(raw))
    }
}
