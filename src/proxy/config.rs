use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Path prefixes owned by the router itself. An alias with one of these
/// names would be unreachable, so config validation rejects them.
const RESERVED_ALIASES: &[&str] = &["admin", "healthz"];

/// A configured upstream alias. Immutable after start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainMapping {
    /// Upstream base URL, e.g. `https://api.example.org`.
    pub upstream: String,

    /// Per-domain cache TTL override in seconds.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,

    /// Per-domain hourly budget override. Takes precedence over
    /// `throttling.domain_limits`.
    #[serde(default)]
    pub rate_limit_per_hour: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Total upstream request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// When true every request must carry the secure key.
    #[serde(default)]
    pub require_secure_key: bool,

    /// Pre-configured key. When absent and security is enabled, a key is
    /// generated at start and exposed once via `get_secure_key()`.
    #[serde(default)]
    pub secure_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// SQLite file path, or `":memory:"` for an ephemeral store.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    /// Responses larger than this are forwarded but never stored.
    #[serde(default = "default_max_response_size")]
    pub max_cache_response_size: usize,

    /// Entry-count bound; exceeding it triggers LRU eviction.
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            default_ttl_seconds: default_ttl_seconds(),
            max_cache_response_size: default_max_response_size(),
            max_cache_entries: default_max_cache_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlingConfig {
    #[serde(default = "default_requests_per_hour")]
    pub default_requests_per_hour: usize,

    /// Ceiling for the progressive back-off delay, in seconds.
    #[serde(default = "default_progressive_max_delay")]
    pub progressive_max_delay: u64,

    /// Seconds without a violation after which back-off state resets.
    #[serde(default = "default_decay_seconds")]
    pub decay_seconds: u64,

    /// Per-alias hourly budgets keyed by alias.
    #[serde(default)]
    pub domain_limits: HashMap<String, usize>,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            default_requests_per_hour: default_requests_per_hour(),
            progressive_max_delay: default_progressive_max_delay(),
            decay_seconds: default_decay_seconds(),
            domain_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is not set, e.g. "info".
    #[serde(default)]
    pub level: Option<String>,

    /// Optional log file; console output is always on.
    #[serde(default)]
    pub file_path: Option<String>,
}

/// Top-level proxy configuration. Read once at start; domain mappings and
/// security settings are immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub throttling: ThrottlingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub domain_mappings: HashMap<String, DomainMapping>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            cache: CacheConfig::default(),
            throttling: ThrottlingConfig::default(),
            logging: LoggingConfig::default(),
            domain_mappings: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.cache.default_ttl_seconds == 0 {
            return Err(ProxyError::Config(
                "cache.default_ttl_seconds must be > 0".into(),
            ));
        }
        if self.cache.max_cache_entries == 0 {
            return Err(ProxyError::Config(
                "cache.max_cache_entries must be > 0".into(),
            ));
        }
        for (alias, mapping) in &self.domain_mappings {
            if alias.is_empty() {
                return Err(ProxyError::Config("domain alias must be non-empty".into()));
            }
            if alias.contains('/') {
                return Err(ProxyError::Config(format!(
                    "domain alias {alias:?} must not contain '/'"
                )));
            }
            if RESERVED_ALIASES.contains(&alias.as_str()) {
                return Err(ProxyError::Config(format!(
                    "domain alias {alias:?} is reserved"
                )));
            }
            let url = reqwest::Url::parse(&mapping.upstream)
                .map_err(|e| ProxyError::Config(format!("{alias}: invalid upstream: {e}")))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ProxyError::Config(format!(
                    "{alias}: upstream must be http(s), got {}",
                    url.scheme()
                )));
            }
            if let Some(ttl) = mapping.ttl_seconds {
                if ttl == 0 {
                    return Err(ProxyError::Config(format!(
                        "{alias}: ttl_seconds must be > 0"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Effective hourly budget for an alias: mapping override, then the
    /// throttling domain table, then the global default.
    pub fn rate_limit_for(&self, alias: &str) -> usize {
        self.domain_mappings
            .get(alias)
            .and_then(|m| m.rate_limit_per_hour)
            .or_else(|| self.throttling.domain_limits.get(alias).copied())
            .unwrap_or(self.throttling.default_requests_per_hour)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    60
}

fn default_database_path() -> String {
    ":memory:".to_string()
}

fn default_ttl_seconds() -> u64 {
    86400
}

fn default_max_response_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_cache_entries() -> usize {
    1000
}

fn default_requests_per_hour() -> usize {
    1000
}

fn default_progressive_max_delay() -> u64 {
    300
}

fn default_decay_seconds() -> u64 {
    600
}
