//! Engine counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected while evaluating requests.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub evaluations: AtomicU64,
    pub matched: AtomicU64,
    pub errors: AtomicU64,
    pub rule_cache_hits: AtomicU64,
    pub rule_cache_misses: AtomicU64,
    /// Lookups served from last-known or empty rules after a source failure
    pub degraded_lookups: AtomicU64,
    pub challenges_issued: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`] plus counters owned elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub evaluations: u64,
    pub matched: u64,
    pub errors: u64,
    pub rule_cache_hits: u64,
    pub rule_cache_misses: u64,
    pub degraded_lookups: u64,
    pub challenges_issued: u64,
    pub regex_failures: u64,
    pub cache_fallbacks: u64,
    pub audit_dropped: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rule_cache_hits: self.rule_cache_hits.load(Ordering::Relaxed),
            rule_cache_misses: self.rule_cache_misses.load(Ordering::Relaxed),
            degraded_lookups: self.degraded_lookups.load(Ordering::Relaxed),
            challenges_issued: self.challenges_issued.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        }
    }
}
