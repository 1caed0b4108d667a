//! Endpoint URL construction.
//!
//! An explicit `ws://` scheme is kept; every other scheme (or none) is
//! replaced by `wss://`. The host must be `localhost` or a dotted name.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{Result, SettingsError};

static SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:(\w*)://)?(.*)$").unwrap());

static DOTTED_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .unwrap()
});

/// Normalize an endpoint into a WebSocket base URL.
pub fn endpoint_url(endpoint: &str) -> Result<String> {
    let invalid = || SettingsError::InvalidUrl(endpoint.to_string());

    let caps = SCHEME.captures(endpoint.trim()).ok_or_else(invalid)?;
    let scheme = match caps.get(1).map(|m| m.as_str()) {
        Some("ws") => "ws",
        _ => "wss",
    };
    let rest = caps.get(2).map_or("", |m| m.as_str()).trim_end_matches('/');

    let host = rest
        .split(['/', ':', '?'])
        .next()
        .unwrap_or_default();
    if host != "localhost" && !DOTTED_HOST.is_match(host) {
        return Err(invalid());
    }

    Ok(format!("{scheme}://{rest}"))
}
