//! Embeddable proxy facade wiring the core components together.
//!
//! Each worker receives an `AppState` bundling shared references; there is
//! no process-wide singleton.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderMap;

use crate::error::ProxyError;
use crate::proxy::cache::{CacheEngine, CacheStats};
use crate::proxy::config::ProxyConfig;
use crate::proxy::monitor::{MetricsSnapshot, ProxyMonitor};
use crate::proxy::security::SecurityGate;
use crate::proxy::server::{AppState, AxumServer};
use crate::proxy::store::Store;
use crate::proxy::throttle::{ThrottleManager, ThrottleState};
use crate::proxy::upstream::UpstreamClient;

/// Capacity of the metrics event ring.
const MONITOR_CAPACITY: usize = 1000;

/// Main entry point for the caching proxy.
pub struct CachingProxy {
    config: Arc<ProxyConfig>,
    security: Arc<SecurityGate>,
    cache: Arc<CacheEngine>,
    throttle: Arc<ThrottleManager>,
    upstream: Arc<UpstreamClient>,
    monitor: Arc<ProxyMonitor>,
    server: Option<AxumServer>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl CachingProxy {
    /// Validate the configuration and initialize all components. A corrupt
    /// or locked database is fatal here.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;

        let store = Arc::new(Store::new(&config.cache.database_path)?);
        let cache = Arc::new(CacheEngine::new(
            store,
            config.cache.default_ttl_seconds,
            config.cache.max_cache_response_size,
            config.cache.max_cache_entries,
        ));

        // Fold mapping-level budget overrides into the throttling table.
        let mut domain_limits: HashMap<String, usize> =
            config.throttling.domain_limits.clone();
        for (alias, mapping) in &config.domain_mappings {
            if let Some(limit) = mapping.rate_limit_per_hour {
                domain_limits.insert(alias.clone(), limit);
            }
        }
        let throttle = Arc::new(ThrottleManager::new(&config.throttling, domain_limits));

        let security = Arc::new(SecurityGate::new(&config.security));
        let upstream = Arc::new(UpstreamClient::new(config.server.request_timeout)?);
        let monitor = Arc::new(ProxyMonitor::new(MONITOR_CAPACITY));

        Ok(Self {
            config: Arc::new(config),
            security,
            cache,
            throttle,
            upstream,
            monitor,
            server: None,
            handle: None,
        })
    }

    fn app_state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            security: self.security.clone(),
            cache: self.cache.clone(),
            throttle: self.throttle.clone(),
            upstream: self.upstream.clone(),
            monitor: self.monitor.clone(),
        }
    }

    /// Bind and start serving in the background.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        if self.server.is_some() {
            return Err(ProxyError::Config("server is already running".into()));
        }
        let (server, handle) = AxumServer::start(self.app_state()).await?;
        self.server = Some(server);
        self.handle = Some(handle);
        Ok(())
    }

    /// Address actually bound, once started.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr())
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// Stop the server and wait for the accept loop to wind down. Safe to
    /// call when not running.
    pub async fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// The proxy access key, exposed once so operators can hand it to
    /// clients. None when security is disabled.
    pub fn get_secure_key(&self) -> Option<String> {
        if self.security.enabled() {
            self.security.secure_key().map(str::to_string)
        } else {
            None
        }
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.monitor.snapshot()
    }

    pub fn clear_cache(&self, domain: Option<&str>) -> Result<usize, ProxyError> {
        tracing::info!("clearing cache for domain: {:?}", domain);
        self.cache.clear(domain)
    }

    pub fn cache_stats(&self) -> Result<CacheStats, ProxyError> {
        self.cache.stats()
    }

    pub fn throttle_state(&self, domain: &str) -> ThrottleState {
        self.throttle.state(domain)
    }

    /// Run the security gate against a request shape without serving it.
    /// Returns whether it would be admitted, plus a rejection reason.
    pub fn validate_request(
        &self,
        path: &str,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> (bool, Option<String>) {
        match self.security.authorize(path, headers, query) {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        }
    }
}
