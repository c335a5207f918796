//! HTTP → tunnel proxy handler.
//!
//! Every request that is not a built-in route lands here. The first path
//! segment names the device; the remainder (with the query) is forwarded
//! as the device-relative URI:
//!
//! ```text
//! GET /dev1/status?verbose=1  →  device "dev1", uri "/status?verbose=1"
//! ```

use std::time::{Duration, Instant};

use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use burrow_core::frame::{self, RequestFrame, ResponseFrame};
use burrow_core::TunnelError;
use metrics::{counter, histogram};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{TUNNEL_REQUEST_DURATION_SECONDS, TUNNEL_REQUESTS_TOTAL};
use crate::server::AppState;
use crate::session::{AuthError, Capabilities};

/// Why a proxied request did not produce a device response.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request path does not name a device.
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    /// Protocol upgrades cannot cross the tunnel.
    #[error("can not upgrade tunnel connection")]
    Upgrade,
    /// A session is required and no bearer token was sent.
    #[error("missing bearer token")]
    Unauthorized,
    /// The session lookup failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The session lacks the capability for this method on this device.
    #[error("token may not {action} device {device}")]
    Forbidden {
        /// Target device.
        device: String,
        /// `"read"` or `"write"`.
        action: &'static str,
    },
    /// The request body exceeds the configured limit.
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
    /// The tunnel round trip failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// The device answered with a status HTTP cannot carry.
    #[error("device returned invalid status code {0}")]
    BadStatus(u16),
}

impl ProxyError {
    /// HTTP status returned to the caller.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Upgrade => StatusCode::BAD_REQUEST,
            Self::Unauthorized | Self::Auth(AuthError::Rejected(_)) => StatusCode::UNAUTHORIZED,
            Self::Auth(_) | Self::BadStatus(_) => StatusCode::BAD_GATEWAY,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Tunnel(e) => match e {
                TunnelError::BrokerDisconnected => StatusCode::SERVICE_UNAVAILABLE,
                TunnelError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                // Only encoding can fail this way on the way out: a field
                // over the 24-bit limit.
                TunnelError::MalformedFrame(_) => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Upgrade => "UPGRADE_NOT_SUPPORTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Auth(e) => e.code(),
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Tunnel(e) => e.code(),
            Self::BadStatus(_) => "BAD_UPSTREAM_STATUS",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (self.status(), body).into_response()
    }
}

/// Fallback handler: forward the request to its device and relay the answer.
#[instrument(name = "proxy", skip_all, fields(method = %request.method(), uri = %request.uri()))]
pub async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let result = forward(&state, request).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    counter!(TUNNEL_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(TUNNEL_REQUEST_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, code = e.code(), "proxy request failed");
            e.into_response()
        }
    }
}

async fn forward(state: &AppState, request: Request) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    if wants_upgrade(&parts.headers) {
        return Err(ProxyError::Upgrade);
    }
    let (device_id, uri) = split_target(&parts.uri)?;
    let (deadline, consumed_auth) =
        check_session(state, &parts.headers, parts.method.as_str(), device_id).await?;

    let max = state.config.max_body_bytes;
    if content_length(&parts.headers).is_some_and(|len| len > max) {
        return Err(ProxyError::PayloadTooLarge(max));
    }
    let body = to_bytes(body, max)
        .await
        .map_err(|_| ProxyError::PayloadTooLarge(max))?;

    let request = RequestFrame {
        method: parts.method.to_string(),
        uri: uri.to_string(),
        headers: wire_headers(&parts.headers, consumed_auth),
        body,
    };
    let response = state.registry.round_trip(device_id, &request, deadline).await?;
    info!(
        device = device_id,
        status = response.status,
        size = response.body.len(),
        "proxied request"
    );
    build_response(response)
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        || headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Split `/<device>/<rest>` into the device id and the device-relative URI.
fn split_target(uri: &Uri) -> Result<(&str, &str), ProxyError> {
    let path = uri.path();
    let rest = path
        .strip_prefix('/')
        .ok_or(ProxyError::BadRequest("path must start with /"))?;
    let slash = rest
        .find('/')
        .ok_or(ProxyError::BadRequest("path must be /<device>/<resource>"))?;
    let device_id = &rest[..slash];
    if device_id.is_empty() {
        return Err(ProxyError::BadRequest("empty device id"));
    }
    if device_id.contains(['+', '#']) {
        return Err(ProxyError::BadRequest("device id contains a topic wildcard"));
    }
    // The path is a prefix of path-and-query, so the offsets carry over.
    let full = uri.path_and_query().map_or(path, |pq| pq.as_str());
    Ok((device_id, &full[1 + slash..]))
}

/// Look up the caller's session; returns the deadline to use and whether
/// the `Authorization` header was consumed.
async fn check_session(
    state: &AppState,
    headers: &HeaderMap,
    method: &str,
    device_id: &str,
) -> Result<(Duration, bool), ProxyError> {
    let config = &state.config;
    let Some(gate) = &state.sessions else {
        return Ok((config.request_timeout, false));
    };
    let Some(token) = bearer_token(headers) else {
        if config.require_session {
            return Err(ProxyError::Unauthorized);
        }
        return Ok((config.request_timeout, false));
    };

    let session = gate.session(token).await?;
    let required = Capabilities::required_for(method);
    if !session.permissions.allows(device_id, required) {
        return Err(ProxyError::Forbidden {
            device: device_id.to_string(),
            action: if required == Capabilities::READ { "read" } else { "write" },
        });
    }
    Ok((config.session_request_timeout, true))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// `content-type` → `Content-Type`, `x-api-key` → `X-Api-Key`.
pub fn canonical_header_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn wire_headers(headers: &HeaderMap, strip_auth: bool) -> frame::HeaderMap {
    let mut out = frame::HeaderMap::new();
    for (name, value) in headers {
        if name == header::HOST || (strip_auth && name == header::AUTHORIZATION) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            debug!(header = %name, "dropping non-text header value");
            continue;
        };
        out.entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(value.to_string());
    }
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONTENT_LENGTH
        || name == header::TRANSFER_ENCODING
        || name == header::CONNECTION
        || name == header::UPGRADE
        || name.as_str() == "keep-alive"
}

fn build_response(frame: ResponseFrame) -> Result<Response, ProxyError> {
    let status =
        StatusCode::from_u16(frame.status).map_err(|_| ProxyError::BadStatus(frame.status))?;
    let mut response = Response::new(Body::from(frame.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &frame.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "dropping invalid response header name");
            continue;
        };
        if is_hop_by_hop(&name) {
            continue;
        }
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    let _ = headers.append(name.clone(), value);
                }
                Err(_) => debug!(header = %name, "dropping invalid response header value"),
            }
        }
    }
    Ok(response)
}
