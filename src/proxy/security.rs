//! Proxy access-key extraction and constant-time validation.
//!
//! Candidates are read from the `X-API-Buddy-Key` header, an
//! `Authorization: Bearer` header, the `key` query parameter, or the first
//! path segment, in that priority order. Comparison is constant-time.

use std::collections::HashMap;

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::ProxyError;
use crate::proxy::config::SecurityConfig;

pub const KEY_HEADER: &str = "x-api-buddy-key";

/// Per-request authentication gate. Immutable after start.
pub struct SecurityGate {
    enabled: bool,
    key: Option<String>,
}

impl SecurityGate {
    pub fn new(config: &SecurityConfig) -> Self {
        let key = if config.require_secure_key {
            Some(
                config
                    .secure_key
                    .clone()
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(generate_secure_key),
            )
        } else {
            config.secure_key.clone().filter(|k| !k.is_empty())
        };
        Self {
            enabled: config.require_secure_key,
            key,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The configured or generated key, exposed once at startup.
    pub fn secure_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Constant-time comparison against the configured key.
    pub fn validate_key(&self, provided: &str) -> bool {
        match &self.key {
            Some(key) => key.as_bytes().ct_eq(provided.as_bytes()).into(),
            None => false,
        }
    }

    /// Authenticate a request and return the sanitized path (the token
    /// path-prefix stripped when present). When security is disabled every
    /// request is admitted and the path is never rewritten.
    pub fn authorize(
        &self,
        path: &str,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> Result<String, ProxyError> {
        if !self.enabled {
            return Ok(path.to_string());
        }

        let (prefix_is_token, stripped) = self.strip_token_prefix(path);
        let authenticated = self
            .candidate_from_headers(headers)
            .or_else(|| query.get("key").cloned())
            .map(|candidate| self.validate_key(&candidate))
            .unwrap_or(false)
            || prefix_is_token;

        if authenticated {
            Ok(stripped)
        } else {
            Err(ProxyError::Auth)
        }
    }

    fn candidate_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(value) = headers.get(KEY_HEADER).and_then(|v| v.to_str().ok()) {
            return Some(value.to_string());
        }
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|auth| {
                let (scheme, rest) = auth.split_once(' ')?;
                scheme
                    .eq_ignore_ascii_case("bearer")
                    .then(|| rest.trim().to_string())
            })
    }

    /// If the first path segment equals the token, drop it. Returns whether
    /// it matched and the effective path.
    fn strip_token_prefix(&self, path: &str) -> (bool, String) {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let (first, rest) = match trimmed.split_once('/') {
            Some((first, rest)) => (first, format!("/{rest}")),
            None => (trimmed, "/".to_string()),
        };
        if !first.is_empty() && self.validate_key(first) {
            (true, rest)
        } else {
            (false, path.to_string())
        }
    }
}

/// 256 bits from the OS RNG, URL-safe base64 without padding.
pub fn generate_secure_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
