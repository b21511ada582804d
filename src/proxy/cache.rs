//! Content-addressed response cache with per-domain TTL and compression.
//!
//! Entries are keyed by a deterministic fingerprint of the rewritten
//! upstream request. Only success/redirect responses are stored; freshness
//! is evaluated at lookup time against the TTL the row was stored with.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ProxyError;
use crate::proxy::store::Store;

/// Payloads strictly larger than this are zlib-compressed before storage.
const COMPRESSION_THRESHOLD: usize = 1024;

/// A cached upstream response as returned by `lookup` (payload already
/// decompressed).
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub domain: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub ttl_seconds: u64,
    pub access_count: u64,
    pub last_accessed_at: i64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub expired: u64,
    pub evictions: u64,
    pub entry_count: u64,
    pub bytes_stored: u64,
    pub entries_per_domain: HashMap<String, u64>,
    pub ttl_distribution: HashMap<u64, u64>,
}

pub struct CacheEngine {
    store: Arc<Store>,
    default_ttl_seconds: u64,
    max_response_size: usize,
    max_entries: usize,
    counters: Counters,
}

impl CacheEngine {
    pub fn new(
        store: Arc<Store>,
        default_ttl_seconds: u64,
        max_response_size: usize,
        max_entries: usize,
    ) -> Self {
        let engine = Self {
            store,
            default_ttl_seconds,
            max_response_size,
            max_entries,
            counters: Counters::default(),
        };
        // Sweep rows that expired while the proxy was down.
        if let Err(e) = engine.cleanup_expired() {
            tracing::warn!("startup cache sweep failed: {}", e);
        }
        engine
    }

    /// Deterministic request digest: method, normalized upstream URL, and
    /// (for non-empty bodies) the canonicalized body plus content type.
    pub fn generate_fingerprint(
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        content_type: Option<&str>,
    ) -> String {
        let mut components = vec![method.to_uppercase(), normalize_url(url)];
        if let Some(body) = body.filter(|b| !b.is_empty()) {
            components.push(canonicalize_body(body, content_type));
            components.push(content_type.unwrap_or("").to_string());
        }
        let mut hasher = Sha256::new();
        hasher.update(components.join(":").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Return the entry for `fingerprint` if it exists and is still fresh.
    /// An unfresh row is deleted inline before reporting a miss.
    pub fn lookup(&self, fingerprint: &str) -> Result<Option<CachedResponse>, ProxyError> {
        let rows = self.store.execute_query(
            "SELECT domain, status, headers_blob, payload_blob, compressed,
                    created_at, ttl_seconds, last_accessed_at, access_count
             FROM cache_entries WHERE fingerprint = ?1",
            [fingerprint],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            },
        )?;

        let Some((
            domain,
            status,
            headers_blob,
            payload,
            compressed,
            created_at,
            ttl_seconds,
            _last_accessed_at,
            access_count,
        )) = rows.into_iter().next()
        else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let now = now_unix();
        let ttl_seconds = ttl_seconds.max(0) as u64;
        if now - created_at >= ttl_seconds as i64 {
            self.store.execute_update(
                "DELETE FROM cache_entries WHERE fingerprint = ?1",
                [fingerprint],
            )?;
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let payload = if compressed {
            match inflate(&payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Undecodable row: drop it and degrade to a miss.
                    tracing::warn!("failed to inflate cached payload: {}", e);
                    self.store.execute_update(
                        "DELETE FROM cache_entries WHERE fingerprint = ?1",
                        [fingerprint],
                    )?;
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            }
        } else {
            payload
        };

        let headers: HashMap<String, String> =
            serde_json::from_str(&headers_blob).unwrap_or_default();

        self.store.execute_update(
            "UPDATE cache_entries
             SET access_count = access_count + 1, last_accessed_at = ?1
             WHERE fingerprint = ?2",
            rusqlite::params![now, fingerprint],
        )?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);

        Ok(Some(CachedResponse {
            domain,
            status,
            headers,
            payload,
            created_at,
            ttl_seconds,
            access_count: access_count.max(0) as u64 + 1,
            last_accessed_at: now,
        }))
    }

    /// Store a response. Returns false (without error) when the response is
    /// not cacheable: non-success status or oversized payload.
    pub fn store(
        &self,
        fingerprint: &str,
        domain: &str,
        status: u16,
        headers: &HashMap<String, String>,
        payload: &[u8],
        ttl_override: Option<u64>,
    ) -> Result<bool, ProxyError> {
        if !(200..=399).contains(&status) {
            return Ok(false);
        }
        // Size is judged on the original bytes, before compression.
        if payload.len() > self.max_response_size {
            return Ok(false);
        }

        let ttl_seconds = ttl_override.unwrap_or(self.default_ttl_seconds);
        let headers_blob = serde_json::to_string(headers)
            .map_err(|e| ProxyError::Cache(format!("header serialization: {e}")))?;

        let (stored_payload, compressed) = if payload.len() > COMPRESSION_THRESHOLD {
            match deflate(payload) {
                Ok(bytes) => (bytes, true),
                Err(e) => {
                    tracing::warn!("compression failed, storing raw: {}", e);
                    (payload.to_vec(), false)
                }
            }
        } else {
            (payload.to_vec(), false)
        };

        // The serve that triggered this store counts as the first access.
        let now = now_unix();
        self.store.execute_update(
            "REPLACE INTO cache_entries
                 (fingerprint, domain, status, headers_blob, payload_blob,
                  compressed, created_at, ttl_seconds, last_accessed_at, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?7, 1)",
            rusqlite::params![
                fingerprint,
                domain,
                status,
                headers_blob,
                stored_payload,
                compressed,
                now,
                ttl_seconds as i64,
            ],
        )?;
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        self.evict_if_needed()?;
        Ok(true)
    }

    /// Remove entries for one domain, or everything.
    pub fn clear(&self, domain: Option<&str>) -> Result<usize, ProxyError> {
        match domain {
            Some(domain) => self
                .store
                .execute_update("DELETE FROM cache_entries WHERE domain = ?1", [domain]),
            None => self.store.execute_update("DELETE FROM cache_entries", []),
        }
    }

    pub fn stats(&self) -> Result<CacheStats, ProxyError> {
        let entry_count = self
            .store
            .query_scalar("SELECT COUNT(*) FROM cache_entries", [])?;
        let bytes_stored = self
            .store
            .query_scalar("SELECT SUM(LENGTH(payload_blob)) FROM cache_entries", [])?;
        let entries_per_domain = self
            .store
            .execute_query(
                "SELECT domain, COUNT(*) FROM cache_entries GROUP BY domain",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?
            .into_iter()
            .map(|(domain, n)| (domain, n.max(0) as u64))
            .collect();
        let ttl_distribution = self
            .store
            .execute_query(
                "SELECT ttl_seconds, COUNT(*) FROM cache_entries GROUP BY ttl_seconds",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?
            .into_iter()
            .map(|(ttl, n)| (ttl.max(0) as u64, n.max(0) as u64))
            .collect();

        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entry_count: entry_count.max(0) as u64,
            bytes_stored: bytes_stored.max(0) as u64,
            entries_per_domain,
            ttl_distribution,
        })
    }

    fn evict_if_needed(&self) -> Result<(), ProxyError> {
        let count = self
            .store
            .query_scalar("SELECT COUNT(*) FROM cache_entries", [])?;
        let over = count - self.max_entries as i64;
        if over <= 0 {
            return Ok(());
        }
        let evicted = self.store.execute_update(
            "DELETE FROM cache_entries WHERE fingerprint IN (
                 SELECT fingerprint FROM cache_entries
                 ORDER BY last_accessed_at ASC LIMIT ?1
             )",
            [over],
        )?;
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        Ok(())
    }

    fn cleanup_expired(&self) -> Result<(), ProxyError> {
        let removed = self.store.execute_update(
            "DELETE FROM cache_entries WHERE ?1 - created_at >= ttl_seconds",
            [now_unix()],
        )?;
        if removed > 0 {
            tracing::debug!("removed {} expired cache entries at startup", removed);
            self.counters
                .expired
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Normalize a URL for fingerprinting: lowercase scheme/host, sorted query
/// pairs, trailing slashes insignificant except at the root.
fn normalize_url(raw: &str) -> String {
    let Ok(url) = url::Url::parse(raw) else {
        // Unparseable input still fingerprints deterministically.
        return raw.to_string();
    };

    let mut path = url.path().trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    let query = if pairs.is_empty() {
        String::new()
    } else {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        format!("?{encoded}")
    };

    let host = url.host_str().unwrap_or("").to_lowercase();
    let port = url
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    format!("{}://{}{}{}{}", url.scheme(), host, port, path, query)
}

/// Canonical body representation: JSON bodies re-serialize with sorted
/// object keys, anything else contributes its digest.
fn canonicalize_body(body: &[u8], content_type: Option<&str>) -> String {
    if content_type.is_some_and(|ct| ct.contains("application/json")) {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            // Value objects re-serialize with sorted keys.
            if let Ok(canonical) = serde_json::to_string(&value) {
                return canonical;
            }
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
