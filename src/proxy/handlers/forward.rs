//! The request pipeline: authenticate, route, cache, throttle, forward.
//!
//! Ordering is load-bearing. The cache is consulted before the throttle
//! manager, so hits are always served regardless of rate state, and the
//! throttle only accounts for traffic that would actually reach upstream.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::proxy::cache::CacheEngine;
use crate::proxy::monitor::EventKind;
use crate::proxy::server::AppState;
use crate::proxy::upstream::client::{filter_request_headers, parse_retry_after};

/// Fallback handler: everything that is not a reserved route runs the
/// proxy pipeline.
pub async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();

    state
        .monitor
        .record(EventKind::RequestReceived, None, None);

    let query_map = parse_query(uri.query());

    // 1. Security gate. Nothing else sees an unauthenticated request.
    let path = match state.security.authorize(uri.path(), &headers, &query_map) {
        Ok(path) => path,
        Err(e) => {
            state.monitor.record(EventKind::AuthFail, None, None);
            return e.into_response();
        }
    };
    if state.security.enabled() {
        state.monitor.record(EventKind::AuthPass, None, None);
    }

    // 2. Resolve `/<alias>/<rest>` against the configured mappings.
    let Some((alias, rest)) = split_alias(&path) else {
        return ProxyError::Routing(path).into_response();
    };
    let Some(mapping) = state.config.domain_mappings.get(&alias) else {
        debug!("no upstream mapping for alias: {}", alias);
        return ProxyError::Routing(alias).into_response();
    };

    // 3. Rewrite to the upstream URL, dropping a consumed `key` parameter.
    let upstream_url = build_upstream_url(
        &mapping.upstream,
        &rest,
        uri.query(),
        state.security.enabled(),
    );

    let body = match axum::body::to_bytes(request.into_body(), crate::proxy::server::MAX_REQUEST_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to read request body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                "Bad Request: unreadable body\n",
            )
                .into_response();
        }
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let fingerprint = CacheEngine::generate_fingerprint(
        method.as_str(),
        &upstream_url,
        Some(body.as_ref()),
        content_type.as_deref(),
    );

    // 4. Cache first. A storage failure degrades to pass-through.
    let mut cache_usable = true;
    match state.cache.lookup(&fingerprint) {
        Ok(Some(cached)) => {
            info!("cache hit for {} {}", method, upstream_url);
            let mut detail = HashMap::new();
            detail.insert("bytes".to_string(), cached.payload.len().to_string());
            state
                .monitor
                .record_detailed(EventKind::CacheHit, Some(alias.as_str()), Some(0), detail);
            return cached_response(cached.status, &cached.headers, cached.payload);
        }
        Ok(None) => {
            debug!("cache miss for {} {}", method, upstream_url);
            state.monitor.record(EventKind::CacheMiss, Some(alias.as_str()), None);
        }
        Err(e) => {
            warn!("cache lookup degraded to pass-through: {}", e);
            cache_usable = false;
            state.monitor.record(EventKind::CacheMiss, Some(alias.as_str()), None);
        }
    }

    // 5. Throttle, misses only.
    if !state.throttle.should_admit(&alias) {
        state.throttle.record_violation(&alias);
        let retry_after = state.throttle.retry_after(&alias);
        info!(
            "throttling {}: retry after {}s (violations={})",
            alias,
            retry_after,
            state.throttle.state(&alias).violations
        );
        state.monitor.record(EventKind::Throttled, Some(alias.as_str()), None);
        return ProxyError::Throttled {
            domain: alias,
            retry_after,
        }
        .into_response();
    }
    state.throttle.record_admission(&alias);

    // 6. Forward upstream.
    let forward_headers = filter_request_headers(&headers, state.security.secure_key());
    let upstream_body = (!body.is_empty()).then(|| body.clone());
    let response = match state
        .upstream
        .forward(method.clone(), &upstream_url, forward_headers, upstream_body)
        .await
    {
        Ok(response) => response,
        // UpstreamTransport maps to 502, anything else to 500.
        Err(e) => {
            warn!("upstream request failed for {}: {}", upstream_url, e);
            state
                .monitor
                .record(EventKind::UpstreamError, Some(alias.as_str()), None);
            return e.into_response();
        }
    };

    // An explicit upstream 429 counts as a throttle violation; transport
    // failures above do not.
    if response.status == 429 {
        let hint = parse_retry_after(&response.headers, &response.body);
        info!(
            "upstream 429 for {} (retry hint: {:?})",
            alias, hint
        );
        state.throttle.record_violation(&alias);
    }

    let mut detail = HashMap::new();
    detail.insert("bytes".to_string(), response.body.len().to_string());
    detail.insert("status".to_string(), response.status.to_string());
    if response.status >= 500 {
        state.monitor.record_detailed(
            EventKind::UpstreamError,
            Some(alias.as_str()),
            Some(response.latency_ms),
            detail,
        );
    } else {
        state.monitor.record_detailed(
            EventKind::UpstreamOk,
            Some(alias.as_str()),
            Some(response.latency_ms),
            detail,
        );
    }

    // 7. Store success/redirect responses. Failures never affect the client.
    if cache_usable && (200..=399).contains(&response.status) {
        match state.cache.store(
            &fingerprint,
            &alias,
            response.status,
            &response.headers,
            &response.body,
            mapping.ttl_seconds,
        ) {
            Ok(true) => {
                state
                    .monitor
                    .record(EventKind::CacheStore, Some(alias.as_str()), None);
            }
            Ok(false) => {
                debug!("response for {} not cacheable", upstream_url);
            }
            Err(e) => {
                warn!("cache store failed, serving uncached: {}", e);
            }
        }
    }

    cached_response(response.status, &response.headers, response.body.to_vec())
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let Some(query) = query else {
        return HashMap::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Split a sanitized path into `(alias, rest)`. `rest` keeps its leading
/// slash; `/cn` maps to `("cn", "/")`.
fn split_alias(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('/') {
        Some((alias, rest)) => Some((alias.to_string(), format!("/{rest}"))),
        None => Some((trimmed.to_string(), "/".to_string())),
    }
}

/// Join the upstream base with the remaining path and the original query
/// string, minus a `key` parameter consumed by the security gate.
fn build_upstream_url(
    upstream_base: &str,
    rest: &str,
    query: Option<&str>,
    security_enabled: bool,
) -> String {
    let base = upstream_base.trim_end_matches('/');
    let mut url = format!("{base}{rest}");
    if let Some(query) = query {
        let forwarded: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .filter(|(k, _)| !(security_enabled && k == "key"))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if !forwarded.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(forwarded)
                .finish();
            url.push('?');
            url.push_str(&encoded);
        }
    }
    url
}

/// Build the client response from normalized headers and a contiguous body.
fn cached_response(status: u16, headers: &HashMap<String, String>, payload: Vec<u8>) -> Response {
    let mut header_map = HeaderMap::new();
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        header_map.insert(name, value);
    }
    header_map.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&payload.len().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    let mut response = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(headers) = response.headers_mut() {
        *headers = header_map;
    }
    response
        .body(Body::from(payload))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_alias() {
        assert_eq!(
            split_alias("/cn/foo/bar"),
            Some(("cn".to_string(), "/foo/bar".to_string()))
        );
        assert_eq!(split_alias("/cn"), Some(("cn".to_string(), "/".to_string())));
        assert_eq!(split_alias("/"), None);
        assert_eq!(split_alias(""), None);
    }

    #[test]
    fn test_build_upstream_url_joins_and_keeps_query() {
        let url = build_upstream_url("https://api.example.org/", "/foo", Some("a=1&b=2"), false);
        assert_eq!(url, "https://api.example.org/foo?a=1&b=2");
    }

    #[test]
    fn test_build_upstream_url_drops_consumed_key() {
        let url = build_upstream_url(
            "https://api.example.org",
            "/foo",
            Some("a=1&key=secret"),
            true,
        );
        assert_eq!(url, "https://api.example.org/foo?a=1");

        // Security disabled: nothing was consumed, forward verbatim.
        let url = build_upstream_url(
            "https://api.example.org",
            "/foo",
            Some("a=1&key=secret"),
            false,
        );
        assert_eq!(url, "https://api.example.org/foo?a=1&key=secret");
    }

    #[test]
    fn test_build_upstream_url_root_rest() {
        let url = build_upstream_url("https://api.example.org", "/", None, false);
        assert_eq!(url, "https://api.example.org/");
    }

    #[test]
    fn test_parse_query() {
        let map = parse_query(Some("a=1&key=T"));
        assert_eq!(map.get("a").unwrap(), "1");
        assert_eq!(map.get("key").unwrap(), "T");
        assert!(parse_query(None).is_empty());
    }
}
