//! End-to-end pipeline tests against a stub upstream.
//!
//! Each test starts a real proxy on an ephemeral port and a bare TCP
//! upstream that returns canned HTTP/1.1 responses, then drives the proxy
//! with a plain reqwest client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use api_buddy::proxy::config::{DomainMapping, ProxyConfig, SecurityConfig};
use api_buddy::CachingProxy;

/// Canned-response upstream. Counts requests and records their raw text.
struct StubUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StubUpstream {
    async fn spawn(response: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let hits_inner = hits.clone();
        let requests_inner = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                hits_inner.fetch_add(1, Ordering::SeqCst);
                let requests_inner = requests_inner.clone();
                let mut buf = Vec::new();
                // Read the head, then any content-length body.
                let mut chunk = [0u8; 4096];
                let body_needed = loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        break 0;
                    };
                    if n == 0 {
                        break 0;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(head_end) = find_head_end(&buf) {
                        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
                        let content_length = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        let have = buf.len() - head_end;
                        break content_length.saturating_sub(have);
                    }
                };
                let mut remaining = body_needed;
                while remaining > 0 {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        break;
                    };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    remaining = remaining.saturating_sub(n);
                }
                requests_inner
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&buf).into_owned());
                let _ = stream.write_all(response).await;
                let _ = stream.flush().await;
            }
        });

        Self {
            addr,
            hits,
            requests,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> String {
        self.requests.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

const PLAIN_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 16\r\n\
    Connection: close\r\n\r\n\
    upstream says hi";

const CHUNKED_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/plain\r\n\
    Transfer-Encoding: chunked\r\n\
    Connection: close\r\n\r\n\
    b\r\nhello world\r\n0\r\n\r\n";

const RATE_LIMITED_RESPONSE: &[u8] = b"HTTP/1.1 429 Too Many Requests\r\n\
    Content-Type: text/plain\r\n\
    Retry-After: 7\r\n\
    Content-Length: 9\r\n\
    Connection: close\r\n\r\n\
    slow down";

const SERVER_ERROR_RESPONSE: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 5\r\n\
    Connection: close\r\n\r\n\
    oops!";

const REDIRECT_RESPONSE: &[u8] = b"HTTP/1.1 302 Found\r\n\
    Location: https://elsewhere.example.org/moved\r\n\
    Content-Length: 0\r\n\
    Connection: close\r\n\r\n";

fn config_for(upstream_url: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.server.port = 0;
    config.domain_mappings.insert(
        "cn".to_string(),
        DomainMapping {
            upstream: upstream_url.to_string(),
            ttl_seconds: None,
            rate_limit_per_hour: None,
        },
    );
    config
}

async fn start_proxy(config: ProxyConfig) -> (CachingProxy, String) {
    let mut proxy = CachingProxy::new(config).unwrap();
    proxy.start().await.unwrap();
    let base = format!("http://{}", proxy.bound_addr().unwrap());
    (proxy, base)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_cold_then_warm_get() {
    let upstream = StubUpstream::spawn(PLAIN_RESPONSE).await;
    let (mut proxy, base) = start_proxy(config_for(&upstream.url())).await;
    let client = client();

    // Cold: forwarded upstream, response stored.
    let response = client.get(format!("{base}/cn/foo")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let cold_body = response.text().await.unwrap();
    assert_eq!(cold_body, "upstream says hi");
    assert_eq!(upstream.hit_count(), 1);
    assert!(upstream.last_request().starts_with("GET /foo HTTP/1.1"));

    let stats = proxy.cache_stats().unwrap();
    assert_eq!(stats.entry_count, 1);
    assert_eq!(*stats.entries_per_domain.get("cn").unwrap(), 1);
    assert_eq!(*stats.ttl_distribution.get(&86400).unwrap(), 1);
    let total_after_cold = proxy.throttle_state("cn").total_requests;
    assert_eq!(total_after_cold, 1);

    // Warm: served from cache, no upstream call, throttle untouched.
    let response = client.get(format!("{base}/cn/foo")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), cold_body);
    assert_eq!(upstream.hit_count(), 1);
    assert_eq!(proxy.throttle_state("cn").total_requests, total_after_cold);

    let metrics = proxy.get_metrics();
    let counters = metrics.domains.get("cn").unwrap();
    assert_eq!(counters.hits, 1);
    assert_eq!(counters.misses, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_throttle_trip_on_third_miss() {
    let upstream = StubUpstream::spawn(PLAIN_RESPONSE).await;
    let mut config = config_for(&upstream.url());
    config
        .throttling
        .domain_limits
        .insert("cn".to_string(), 2);
    let (mut proxy, base) = start_proxy(config).await;
    let client = client();

    for path in ["a", "b"] {
        let response = client
            .get(format!("{base}/cn/{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    let response = client.get(format!("{base}/cn/c")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 429);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert_eq!(upstream.hit_count(), 2);
    assert!(proxy.throttle_state("cn").violations >= 1);

    let metrics = proxy.get_metrics();
    assert_eq!(metrics.domains.get("cn").unwrap().throttled, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_chunked_upstream_normalized_and_cached() {
    let upstream = StubUpstream::spawn(CHUNKED_RESPONSE).await;
    let (mut proxy, base) = start_proxy(config_for(&upstream.url())).await;
    let client = client();

    let response = client.get(format!("{base}/cn/stream")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().get("transfer-encoding").is_none());
    assert_eq!(
        response.headers().get("content-length").unwrap().to_str().unwrap(),
        "11"
    );
    assert_eq!(response.text().await.unwrap(), "hello world");

    // The cached copy serves the drained bytes too.
    let response = client.get(format!("{base}/cn/stream")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "hello world");
    assert_eq!(upstream.hit_count(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_security_key_positions() {
    let upstream = StubUpstream::spawn(PLAIN_RESPONSE).await;
    let mut config = config_for(&upstream.url());
    config.security = SecurityConfig {
        require_secure_key: true,
        secure_key: Some("sekret-token".to_string()),
    };
    let (mut proxy, base) = start_proxy(config).await;
    let client = client();

    // No key.
    let response = client.get(format!("{base}/cn/foo")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 401);
    assert_eq!(upstream.hit_count(), 0);

    // Query parameter; the key must not be forwarded upstream.
    let response = client
        .get(format!("{base}/cn/foo?key=sekret-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(upstream.last_request().starts_with("GET /foo HTTP/1.1"));

    // Path prefix, consumed before alias resolution.
    let response = client
        .get(format!("{base}/sekret-token/cn/bar"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // Header; stripped before forwarding.
    let response = client
        .get(format!("{base}/cn/baz"))
        .header("X-API-Buddy-Key", "sekret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(!upstream
        .last_request()
        .to_lowercase()
        .contains("x-api-buddy-key"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_per_domain_ttl_override_stored() {
    let upstream = StubUpstream::spawn(PLAIN_RESPONSE).await;
    let mut config = config_for(&upstream.url());
    config.domain_mappings.insert(
        "news".to_string(),
        DomainMapping {
            upstream: upstream.url(),
            ttl_seconds: Some(60),
            rate_limit_per_hour: None,
        },
    );
    let (mut proxy, base) = start_proxy(config).await;
    let client = client();

    client
        .get(format!("{base}/news/x"))
        .send()
        .await
        .unwrap();

    let stats = proxy.cache_stats().unwrap();
    assert_eq!(*stats.ttl_distribution.get(&60).unwrap(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unknown_alias_is_404() {
    let upstream = StubUpstream::spawn(PLAIN_RESPONSE).await;
    let (mut proxy, base) = start_proxy(config_for(&upstream.url())).await;

    let response = client()
        .get(format!("{base}/nope/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(upstream.hit_count(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_upstream_is_502_and_uncached() {
    // Bind and immediately drop a listener so the port refuses connections.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (mut proxy, base) = start_proxy(config_for(&format!("http://{dead_addr}"))).await;

    let response = client()
        .get(format!("{base}/cn/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);

    assert_eq!(proxy.cache_stats().unwrap().entry_count, 0);
    let metrics = proxy.get_metrics();
    assert_eq!(metrics.domains.get("cn").unwrap().upstream_errors, 1);
    // Transport failures are not throttle violations.
    assert_eq!(proxy.throttle_state("cn").violations, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_upstream_5xx_passes_through_uncached() {
    let upstream = StubUpstream::spawn(SERVER_ERROR_RESPONSE).await;
    let (mut proxy, base) = start_proxy(config_for(&upstream.url())).await;
    let client = client();

    for _ in 0..2 {
        let response = client.get(format!("{base}/cn/foo")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 500);
        assert_eq!(response.text().await.unwrap(), "oops!");
    }
    // Never cached, so both requests reached upstream.
    assert_eq!(upstream.hit_count(), 2);
    assert_eq!(proxy.cache_stats().unwrap().entry_count, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_redirect_passed_through_and_cached() {
    let upstream = StubUpstream::spawn(REDIRECT_RESPONSE).await;
    let (mut proxy, base) = start_proxy(config_for(&upstream.url())).await;
    let client = client();

    let response = client.get(format!("{base}/cn/old")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(
        response.headers().get("location").unwrap().to_str().unwrap(),
        "https://elsewhere.example.org/moved"
    );

    // Redirects are cacheable; the second request never reaches upstream.
    let response = client.get(format!("{base}/cn/old")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(upstream.hit_count(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_upstream_429_counts_as_violation() {
    let upstream = StubUpstream::spawn(RATE_LIMITED_RESPONSE).await;
    let (mut proxy, base) = start_proxy(config_for(&upstream.url())).await;

    let response = client()
        .get(format!("{base}/cn/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 429);
    assert_eq!(proxy.throttle_state("cn").violations, 1);
    assert_eq!(proxy.cache_stats().unwrap().entry_count, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_admin_surface() {
    let upstream = StubUpstream::spawn(PLAIN_RESPONSE).await;
    let (mut proxy, base) = start_proxy(config_for(&upstream.url())).await;
    let client = client();

    let response = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    client.get(format!("{base}/cn/foo")).send().await.unwrap();

    let metrics: serde_json::Value = client
        .get(format!("{base}/admin/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["domains"]["cn"]["misses"], 1);

    let stats: serde_json::Value = client
        .get(format!("{base}/admin/cache"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["entry_count"], 1);

    assert_eq!(proxy.throttle_state("cn").total_requests, 1);

    let cleared: serde_json::Value = client
        .delete(format!("{base}/admin/cache/cn"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["cleared"], 1);
    // Domain clear also resets throttle accounting.
    assert_eq!(proxy.throttle_state("cn").total_requests, 0);

    // Unknown alias in the admin path is a 404.
    let response = client
        .delete(format!("{base}/admin/cache/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    proxy.stop().await;
}

#[tokio::test]
async fn test_post_misses_by_body() {
    let upstream = StubUpstream::spawn(PLAIN_RESPONSE).await;
    let (mut proxy, base) = start_proxy(config_for(&upstream.url())).await;
    let client = client();

    let send = |body: &'static str| {
        let client = client.clone();
        let url = format!("{base}/cn/query");
        async move {
            client
                .post(url)
                .header("content-type", "application/json")
                .body(body)
                .send()
                .await
                .unwrap()
        }
    };

    send(r#"{"q": "alpha"}"#).await;
    send(r#"{"q": "beta"}"#).await;
    assert_eq!(upstream.hit_count(), 2);

    // Same JSON value with reordered keys hits the cache.
    let first = send(r#"{"a": 1, "b": 2}"#).await;
    assert_eq!(first.status().as_u16(), 200);
    send(r#"{"b": 2, "a": 1}"#).await;
    assert_eq!(upstream.hit_count(), 3);

    let _ = proxy.get_metrics();
    proxy.stop().await;
}
