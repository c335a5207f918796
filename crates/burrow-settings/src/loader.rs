//! Settings loading.
//!
//! Layers, lowest priority first:
//! 1. Compiled [`BurrowSettings::default()`]
//! 2. The settings file, overlaid key by key with [`overlay`]
//! 3. `BURROW_*` environment variables
//!
//! The result is checked with [`validate`] before it is returned.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::BurrowSettings;

/// Environment variable naming an alternative settings file.
pub const CONFIG_ENV: &str = "BURROW_CONFIG";

/// Resolve the settings file path: `$BURROW_CONFIG`, else
/// `~/.burrow/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(path);
    }
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".burrow").join("settings.json")
}

/// Load from [`settings_path`], tolerating a missing file.
pub fn load_settings() -> Result<BurrowSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path`; a missing file yields the defaults (plus env).
pub fn load_settings_from_path(path: &Path) -> Result<BurrowSettings> {
    let user = if path.is_file() {
        Some(read_document(path)?)
    } else {
        debug!(?path, "no settings file, starting from defaults");
        None
    };
    build(user, |name| std::env::var(name).ok())
}

/// Load from `path`, which must exist.
pub fn load_settings_from_file(path: &Path) -> Result<BurrowSettings> {
    let user = read_document(path)?;
    build(Some(user), |name| std::env::var(name).ok())
}

fn read_document(path: &Path) -> Result<Value> {
    debug!(?path, "reading settings file");
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn build(user: Option<Value>, env: impl Fn(&str) -> Option<String>) -> Result<BurrowSettings> {
    let mut document = serde_json::to_value(BurrowSettings::default())?;
    if let Some(user) = user {
        overlay(&mut document, user);
    }
    let mut settings: BurrowSettings = serde_json::from_value(document)?;
    apply_overrides(&mut settings, env);
    validate(&settings)?;
    Ok(settings)
}

/// Overlay `top` onto `base` in place.
///
/// Objects combine key by key, `null` in `top` leaves the base value
/// alone, and anything else in `top` replaces what was there.
pub fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base), Value::Object(top)) => {
            for (key, value) in top {
                if value.is_null() {
                    continue;
                }
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        let _ = base.insert(key, value);
                    }
                }
            }
        }
        (base, top) => *base = top,
    }
}

/// Apply `BURROW_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut BurrowSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `env`.
///
/// - Integers must parse and fall within the stated range
/// - Booleans accept `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning
pub fn apply_overrides(settings: &mut BurrowSettings, env: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| env(name).filter(|v| !v.is_empty());
    let checked = |name: &str, parsed: Option<u64>, raw: Option<String>| {
        if let (None, Some(raw)) = (parsed, raw) {
            warn!(key = name, value = %raw, "invalid env var, ignoring");
        }
        parsed
    };
    let u64_in = |name: &str, min: u64, max: u64| {
        let raw = string(name);
        let parsed = raw.as_deref().and_then(|v| parse_in_range(v, min..=max));
        checked(name, parsed, raw)
    };
    let boolean = |name: &str| {
        let raw = string(name)?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            warn!(key = name, value = %raw, "invalid boolean env var, ignoring");
        }
        parsed
    };

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(v) = string("BURROW_BROKER_ADDRESS") {
        settings.broker.address = v;
    }
    if let Some(v) = string("BURROW_BROKER_USERNAME") {
        settings.broker.username = v;
    }
    if let Some(v) = string("BURROW_BROKER_PASSWORD") {
        settings.broker.password = v;
    }
    if let Some(v) = string("BURROW_CLIENT_ID") {
        settings.broker.client_id = v;
    }
    if let Some(v) = boolean("BURROW_FRESH_CLIENT_ID") {
        settings.broker.fresh_client_id = v;
    }
    if let Some(v) = u64_in("BURROW_RECONNECT_DELAY_MS", 1, 3_600_000) {
        settings.reconnect.base_delay_ms = v;
        settings.reconnect.max_delay_ms = settings.reconnect.max_delay_ms.max(v);
    }

    // ── HTTP ────────────────────────────────────────────────────────
    if let Some(v) = string("BURROW_LISTEN_ADDR") {
        settings.http.listen_addr = v;
    }

    // ── Tunnel ──────────────────────────────────────────────────────
    if let Some(v) = u64_in("BURROW_REQUEST_TIMEOUT_MS", 1, 3_600_000) {
        settings.tunnel.request_timeout_ms = v;
    }
    if let Some(v) = u64_in("BURROW_SESSION_REQUEST_TIMEOUT_MS", 1, 3_600_000) {
        settings.tunnel.session_request_timeout_ms = v;
    }

    // ── Sessions / auth ─────────────────────────────────────────────
    if let Some(v) = u64_in("BURROW_SESSION_IDLE_SECS", 1, 86_400) {
        settings.session.idle_timeout_secs = v;
    }
    if let Some(v) = boolean("BURROW_REQUIRE_SESSION") {
        settings.session.require_session = v;
    }
    if let Some(v) = string("BURROW_AUTH_URL") {
        settings.auth.url = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("BURROW_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = boolean("BURROW_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Reject settings the server cannot run with.
pub fn validate(settings: &BurrowSettings) -> Result<()> {
    let invalid = |msg: String| Err(SettingsError::InvalidValue(msg));

    if split_host_port(&settings.broker.address).is_none() {
        return invalid(format!(
            "broker.address: expected host:port, got {:?}",
            settings.broker.address
        ));
    }
    if settings.broker.client_id.is_empty() {
        return invalid("broker.clientId: must not be empty".to_string());
    }
    if settings.broker.channel_capacity == 0 {
        return invalid("broker.channelCapacity: must be at least 1".to_string());
    }
    if settings.http.listen_addr.parse::<SocketAddr>().is_err() {
        return invalid(format!(
            "http.listenAddr: expected ip:port, got {:?}",
            settings.http.listen_addr
        ));
    }
    if settings.http.max_body_bytes > burrow_core::frame::MAX_FIELD_LEN {
        return invalid(format!(
            "http.maxBodyBytes: at most {} bytes fit one frame field",
            burrow_core::frame::MAX_FIELD_LEN
        ));
    }
    if settings.tunnel.request_timeout_ms == 0 || settings.tunnel.session_request_timeout_ms == 0
    {
        return invalid("tunnel: request timeouts must be positive".to_string());
    }
    if settings.session.require_session && settings.auth.url.is_none() {
        return invalid("session.requireSession: needs auth.url to check tokens".to_string());
    }
    if !(0.0..=1.0).contains(&settings.reconnect.jitter_factor) {
        return invalid("reconnect.jitterFactor: must be within 0.0..=1.0".to_string());
    }
    Ok(())
}

/// Split `host:port`, accepting an optional `tcp://` or `mqtt://` scheme.
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let rest = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("mqtt://"))
        .unwrap_or(address);
    let (host, port) = rest.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port = parse_in_range(port, 1..=u16::MAX)?;
    Some((host, port))
}

const TRUTHY: [&str; 4] = ["true", "1", "yes", "on"];
const FALSY: [&str; 4] = ["false", "0", "no", "off"];

/// Parse a boolean flag: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`,
/// in any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    let val = val.trim();
    if TRUTHY.iter().any(|t| t.eq_ignore_ascii_case(val)) {
        Some(true)
    } else if FALSY.iter().any(|f| f.eq_ignore_ascii_case(val)) {
        Some(false)
    } else {
        None
    }
}

/// Parse a number, keeping it only if it lies in `range`.
pub fn parse_in_range<T>(val: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| range.contains(n))
}
