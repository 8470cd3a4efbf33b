//! Protocol-boundary helpers: client identity derivation and the CORS
//! origin policy applied to every response.

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, HeaderValue};

/// Rate-limit key used when no address information is available.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// First `X-Forwarded-For` entry, else the socket peer address, else
/// [`UNKNOWN_CLIENT`].
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(first) = forwarded {
        return first.to_string();
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_CLIENT.to_string(),
    }
}

/// Echoes the caller's `Origin` when it starts with the allowed prefix,
/// otherwise answers with a fixed default origin.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_prefix: String,
    default_origin: String,
}

pub const ALLOWED_METHODS: &str = "POST, OPTIONS";
pub const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

impl CorsPolicy {
    pub fn new(allowed_prefix: impl Into<String>, default_origin: impl Into<String>) -> Self {
        Self {
            allowed_prefix: allowed_prefix.into(),
            default_origin: default_origin.into(),
        }
    }

    pub fn allow_origin<'a>(&'a self, origin: Option<&'a str>) -> &'a str {
        match origin {
            Some(o) if !self.allowed_prefix.is_empty() && o.starts_with(&self.allowed_prefix) => o,
            _ => &self.default_origin,
        }
    }

    /// Set `Access-Control-Allow-Origin` (and `Vary: Origin`) on `headers`.
    pub fn apply(&self, origin: Option<&str>, headers: &mut HeaderMap) {
        let allowed = self.allow_origin(origin);
        match HeaderValue::from_str(allowed) {
            Ok(value) => {
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                headers.append(header::VARY, HeaderValue::from_static("origin"));
            }
            Err(err) => {
                tracing::warn!(origin = %allowed, error = %err, "origin is not a valid header value");
            }
        }
    }
}

/// Headers advertised on a preflight response.
pub fn apply_preflight(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
}
