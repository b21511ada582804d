//! Bounded event recorder and per-domain counter aggregation.
//!
//! The pipeline emits one event per decision point. Events land in a
//! fixed-capacity ring (newest-N retained); counters are aggregated per
//! domain and exposed as an immutable snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestReceived,
    AuthPass,
    AuthFail,
    CacheHit,
    CacheMiss,
    Throttled,
    UpstreamOk,
    UpstreamError,
    CacheStore,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub detail: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DomainCounters {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub throttled: u64,
    pub upstream_errors: u64,
    pub bytes_served: u64,
}

/// Immutable metrics snapshot handed to external collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub total_events: u64,
    pub domains: HashMap<String, DomainCounters>,
    pub recent_events: Vec<MetricsEvent>,
}

pub struct ProxyMonitor {
    capacity: usize,
    started_at: DateTime<Utc>,
    enabled: AtomicBool,
    events: Mutex<VecDeque<MetricsEvent>>,
    total_events: Mutex<u64>,
    domains: DashMap<String, DomainCounters>,
}

impl ProxyMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            started_at: Utc::now(),
            enabled: AtomicBool::new(true),
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            total_events: Mutex::new(0),
            domains: DashMap::new(),
        }
    }

    /// Toggle ring recording. Counters are always maintained.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record(&self, kind: EventKind, domain: Option<&str>, latency_ms: Option<u64>) {
        self.record_detailed(kind, domain, latency_ms, HashMap::new());
    }

    pub fn record_detailed(
        &self,
        kind: EventKind,
        domain: Option<&str>,
        latency_ms: Option<u64>,
        detail: HashMap<String, String>,
    ) {
        if let Some(domain) = domain {
            let mut counters = self.domains.entry(domain.to_string()).or_default();
            match kind {
                EventKind::RequestReceived => counters.requests += 1,
                // request_received fires before routing, so hits and misses
                // double as the per-domain request count.
                EventKind::CacheHit => {
                    counters.requests += 1;
                    counters.hits += 1;
                    if let Some(bytes) = detail.get("bytes").and_then(|v| v.parse::<u64>().ok()) {
                        counters.bytes_served += bytes;
                    }
                }
                EventKind::CacheMiss => {
                    counters.requests += 1;
                    counters.misses += 1;
                }
                EventKind::Throttled => counters.throttled += 1,
                EventKind::UpstreamError => counters.upstream_errors += 1,
                EventKind::UpstreamOk => {
                    if let Some(bytes) = detail.get("bytes").and_then(|v| v.parse::<u64>().ok()) {
                        counters.bytes_served += bytes;
                    }
                }
                _ => {}
            }
        }

        *self.total_events.lock().expect("monitor counter poisoned") += 1;

        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let event = MetricsEvent {
            ts: Utc::now(),
            kind,
            domain: domain.map(str::to_string),
            latency_ms,
            detail,
        };
        let mut events = self.events.lock().expect("monitor ring poisoned");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        MetricsSnapshot {
            started_at: self.started_at,
            uptime_seconds: (now - self.started_at).num_seconds(),
            total_events: *self.total_events.lock().expect("monitor counter poisoned"),
            domains: self
                .domains
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            recent_events: self
                .events
                .lock()
                .expect("monitor ring poisoned")
                .iter()
                .cloned()
                .collect(),
        }
    }
}
