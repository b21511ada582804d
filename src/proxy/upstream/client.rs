// Upstream client implementation
// Forwards rewritten requests and normalizes transfer encodings

use std::collections::HashMap;
use std::time::Instant;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use regex::Regex;
use tokio::time::Duration;

use crate::error::ProxyError;
use crate::proxy::security::KEY_HEADER;

/// Headers that must not be forwarded in either direction (RFC 7230 §6.1),
/// plus headers the proxy manages itself.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A fully-drained upstream response with normalized headers.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub latency_ms: u64,
}

pub struct UpstreamClient {
    http_client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(request_timeout_secs: u64) -> Result<Self, ProxyError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(request_timeout_secs))
            // Redirects are passed through to the client verbatim.
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| ProxyError::UpstreamTransport(format!("client build: {e}")))?;
        Ok(Self { http_client })
    }

    /// Forward a request upstream. The body is drained completely, so the
    /// result always carries a concrete length; chunked transfer coding and
    /// upstream content coding never reach the caller.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<UpstreamResponse, ProxyError> {
        let started = Instant::now();

        let mut request = self.http_client.request(
            reqwest::Method::from_bytes(method.as_str().as_bytes())
                .map_err(|e| ProxyError::UpstreamTransport(format!("method: {e}")))?,
            url,
        );
        for (name, value) in headers.iter() {
            if let Ok(value) = value.to_str() {
                request = request.header(name.as_str(), value);
            }
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamTransport(e.to_string()))?;

        let status = response.status().as_u16();
        let mut response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str().to_lowercase();
                if HOP_BY_HOP.contains(&name.as_str())
                    || name == "content-length"
                    || name == "content-encoding"
                {
                    None
                } else {
                    value.to_str().ok().map(|v| (name, v.to_string()))
                }
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::UpstreamTransport(format!("body read: {e}")))?;
        response_headers.insert("content-length".to_string(), body.len().to_string());

        Ok(UpstreamResponse {
            status,
            headers: response_headers,
            body,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Drop headers that must not travel to the upstream: hop-by-hop headers,
/// `Host`/`Content-Length` (the client recomputes them), `Accept-Encoding`
/// (the client negotiates its own), and the proxy's own credentials.
pub fn filter_request_headers(headers: &HeaderMap, proxy_key: Option<&str>) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str())
            || lower == "host"
            || lower == "content-length"
            || lower == "accept-encoding"
            || lower == KEY_HEADER
        {
            continue;
        }
        // The Authorization header is forwarded unless it carries the
        // proxy's own token (it was consumed by the security gate).
        if lower == "authorization" {
            if let (Some(key), Ok(auth)) = (proxy_key, value.to_str()) {
                let bearer = auth
                    .split_once(' ')
                    .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
                    .map(|(_, rest)| rest.trim());
                if bearer == Some(key) {
                    continue;
                }
            }
        }
        filtered.append(name, value.clone());
    }
    filtered
}

/// Best-effort Retry-After extraction from an upstream 429: the standard
/// header first, then common body phrasings.
pub fn parse_retry_after(headers: &HashMap<String, String>, body: &[u8]) -> Option<u64> {
    if let Some(value) = headers.get("retry-after") {
        if let Ok(seconds) = value.trim().parse::<u64>() {
            return Some(seconds);
        }
    }

    let body = std::str::from_utf8(body).ok()?;
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body.trim()) {
        if let Some(retry) = json
            .get("error")
            .and_then(|e| e.get("retry_after"))
            .and_then(|v| v.as_u64())
        {
            return Some(retry);
        }
    }

    let patterns = [
        r"(?i)try again in (\d+)m\s*(\d+)s",
        r"(?i)(?:try again in|retry after|wait)\s*(\d+)\s*s",
    ];
    for pattern in patterns {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        if let Some(caps) = re.captures(body) {
            if caps.len() == 3 {
                if let (Ok(m), Ok(s)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
                    return Some(m * 60 + s);
                }
            } else if let Ok(s) = caps[1].parse::<u64>() {
                return Some(s);
            }
        }
    }
    None
}
