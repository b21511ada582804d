//! Per-domain rate accounting and progressive back-off.
//!
//! Two-tier discipline: a sliding one-hour window enforces the hourly
//! budget, and each violation doubles a cooldown delay up to a configured
//! ceiling. Consulted only on cache misses; cache hits never touch this
//! state.

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;

use crate::proxy::config::ThrottlingConfig;

/// Sliding-window length in seconds.
const TIME_WINDOW_SECS: i64 = 3600;

/// Back-off delay after the first violation, doubled on each subsequent one.
const BASE_DELAY_SECS: u64 = 1;

/// Throttling state for a single domain.
#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    pub violations: u32,
    pub current_delay_seconds: u64,
    pub last_violation_ts: i64,
    pub total_requests: u64,
    pub request_timestamps: VecDeque<i64>,
}

impl ThrottleState {
    fn evict_old(&mut self, now: i64) {
        while let Some(&front) = self.request_timestamps.front() {
            if now - front > TIME_WINDOW_SECS {
                self.request_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn apply_decay(&mut self, now: i64, decay_seconds: u64) {
        if self.violations > 0 && now - self.last_violation_ts >= decay_seconds as i64 {
            self.violations = 0;
            self.current_delay_seconds = 0;
        }
    }

    fn in_cooldown(&self, now: i64) -> bool {
        self.current_delay_seconds > 0
            && now - self.last_violation_ts < self.current_delay_seconds as i64
    }
}

/// Manages rate limiting and progressive throttling per domain alias.
pub struct ThrottleManager {
    default_limit: usize,
    max_delay: u64,
    decay_seconds: u64,
    domain_limits: HashMap<String, usize>,
    states: DashMap<String, ThrottleState>,
}

impl ThrottleManager {
    /// `domain_limits` is the merged per-alias budget table (mapping
    /// overrides already folded in by the caller).
    pub fn new(config: &ThrottlingConfig, domain_limits: HashMap<String, usize>) -> Self {
        Self {
            default_limit: config.default_requests_per_hour,
            max_delay: config.progressive_max_delay,
            decay_seconds: config.decay_seconds,
            domain_limits,
            states: DashMap::new(),
        }
    }

    fn limit_for(&self, domain: &str) -> usize {
        self.domain_limits
            .get(domain)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Whether a miss for `domain` may go upstream right now. Read-only in
    /// effect; window eviction and decay are applied lazily.
    pub fn should_admit(&self, domain: &str) -> bool {
        self.should_admit_at(domain, now_unix())
    }

    fn should_admit_at(&self, domain: &str, now: i64) -> bool {
        let mut state = self.states.entry(domain.to_string()).or_default();
        state.evict_old(now);
        state.apply_decay(now, self.decay_seconds);
        if state.in_cooldown(now) {
            return false;
        }
        state.request_timestamps.len() < self.limit_for(domain)
    }

    /// Record an admitted upstream dispatch.
    pub fn record_admission(&self, domain: &str) {
        self.record_admission_at(domain, now_unix());
    }

    fn record_admission_at(&self, domain: &str, now: i64) {
        let mut state = self.states.entry(domain.to_string()).or_default();
        state.request_timestamps.push_back(now);
        state.total_requests += 1;
        state.evict_old(now);
    }

    /// Record a violation: a denied request, or an explicit upstream 429.
    pub fn record_violation(&self, domain: &str) {
        self.record_violation_at(domain, now_unix());
    }

    fn record_violation_at(&self, domain: &str, now: i64) {
        let mut state = self.states.entry(domain.to_string()).or_default();
        state.apply_decay(now, self.decay_seconds);
        state.violations += 1;
        state.last_violation_ts = now;
        let exponent = state.violations.saturating_sub(1).min(63);
        state.current_delay_seconds = BASE_DELAY_SECS
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay);
    }

    /// Remaining cooldown in seconds, floored at 1 for `Retry-After`.
    pub fn retry_after(&self, domain: &str) -> u64 {
        self.retry_after_at(domain, now_unix())
    }

    fn retry_after_at(&self, domain: &str, now: i64) -> u64 {
        let Some(state) = self.states.get(domain) else {
            return 1;
        };
        let deadline = state.last_violation_ts + state.current_delay_seconds as i64;
        (deadline - now).max(1) as u64
    }

    /// Snapshot of a domain's state.
    pub fn state(&self, domain: &str) -> ThrottleState {
        self.states
            .get(domain)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Clear one domain's state (admin surface).
    pub fn reset(&self, domain: &str) {
        self.states.remove(domain);
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
