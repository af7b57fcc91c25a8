//! Cached per-tenant rule store.
//!
//! Reads go through a TTL cache. Concurrent misses for one tenant share a
//! single upstream load. When the upstream fails or times out the store serves
//! the last rules it loaded successfully, or nothing.

use super::model::Rule;
use super::source::RuleSource;
use crate::cache::TtlCache;
use crate::config::RuleStoreConfig;
use crate::error::RuleSourceError;
use chrono::Utc;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Rules returned for one lookup.
#[derive(Debug, Clone)]
pub struct RuleLookup {
    /// Live rules, priority descending then id ascending
    pub rules: Arc<Vec<Rule>>,
    pub cache_hit: bool,
    /// The upstream failed and stale or empty rules were served
    pub degraded: bool,
    pub error: Option<RuleSourceError>,
}

/// A cached rule list and the invalidation generation it was loaded under.
#[derive(Debug, Clone)]
struct CachedRules {
    generation: u64,
    rules: Arc<Vec<Rule>>,
}

pub struct RuleStore {
    source: Arc<dyn RuleSource>,
    cache: TtlCache<CachedRules>,
    last_known: DashMap<String, Arc<Vec<Rule>>>,
    /// Bumped on every invalidation; entries from older generations are stale
    generations: DashMap<String, u64>,
    source_timeout: Duration,
    serve_stale_on_error: bool,
}

/// Evaluation order: priority descending, then id ascending.
pub fn rule_order(a: &Rule, b: &Rule) -> Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
}

/// Loads attempted per lookup when invalidations keep racing the load.
const MAX_LOAD_ATTEMPTS: usize = 2;

impl RuleStore {
    pub fn new(source: Arc<dyn RuleSource>, config: &RuleStoreConfig) -> Self {
        Self {
            source,
            cache: TtlCache::new(config.cache_capacity, config.cache_ttl()),
            last_known: DashMap::new(),
            generations: DashMap::new(),
            source_timeout: config.source_timeout(),
            serve_stale_on_error: config.serve_stale_on_error,
        }
    }

    /// Live rules for `tenant_id`, in evaluation order.
    pub async fn get_active_rules(&self, tenant_id: &str) -> RuleLookup {
        if let Some(cached) = self.cache.get(tenant_id).await {
            if cached.generation == self.generation(tenant_id) {
                return RuleLookup {
                    rules: Self::still_live(cached.rules),
                    cache_hit: true,
                    degraded: false,
                    error: None,
                };
            }
            self.cache.invalidate(tenant_id).await;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.cache.try_get_with(tenant_id, self.load(tenant_id)).await {
                Ok(cached) => {
                    if cached.generation != self.generation(tenant_id) {
                        // Invalidated while the load was in flight.
                        self.cache.invalidate(tenant_id).await;
                        if attempts < MAX_LOAD_ATTEMPTS {
                            debug!(tenant_id = %tenant_id, "Rules changed during load, reloading");
                            continue;
                        }
                    }
                    return RuleLookup {
                        rules: Self::still_live(cached.rules),
                        cache_hit: false,
                        degraded: false,
                        error: None,
                    };
                }
                Err(e) => return self.fallback(tenant_id, (*e).clone()),
            }
        }
    }

    /// Drop the tenant's cached rules so the next lookup reloads them.
    ///
    /// Loads already in flight when this runs are discarded rather than
    /// cached.
    pub async fn invalidate_cache(&self, tenant_id: &str) {
        *self.generations.entry(tenant_id.to_string()).or_insert(0) += 1;
        self.cache.invalidate(tenant_id).await;
        debug!(tenant_id = %tenant_id, "Rule cache invalidated");
    }

    fn generation(&self, tenant_id: &str) -> u64 {
        self.generations.get(tenant_id).map_or(0, |g| *g)
    }

    fn fallback(&self, tenant_id: &str, error: RuleSourceError) -> RuleLookup {
        let fallback = if self.serve_stale_on_error {
            self.last_known.get(tenant_id).map(|r| Arc::clone(r.value()))
        } else {
            None
        };
        warn!(
            tenant_id = %tenant_id,
            error = %error,
            stale = fallback.is_some(),
            "Rule source failed, serving fallback"
        );
        RuleLookup {
            rules: fallback.map(Self::still_live).unwrap_or_default(),
            cache_hit: false,
            degraded: true,
            error: Some(error),
        }
    }

    async fn load(&self, tenant_id: &str) -> Result<CachedRules, RuleSourceError> {
        let generation = self.generation(tenant_id);
        let loaded = tokio::time::timeout(
            self.source_timeout,
            self.source.load_active_rules(tenant_id),
        )
        .await
        .map_err(|_| RuleSourceError::Timeout(self.source_timeout.as_millis() as u64))??;

        let now = Utc::now();
        let mut rules: Vec<Rule> = loaded.into_iter().filter(|r| r.is_live(now)).collect();
        rules.sort_by(rule_order);

        debug!(tenant_id = %tenant_id, rules = rules.len(), "Loaded tenant rules");

        let rules = Arc::new(rules);
        if self.generation(tenant_id) == generation {
            self.last_known.insert(tenant_id.to_string(), Arc::clone(&rules));
        }
        Ok(CachedRules { generation, rules })
    }

    /// Cached lists may outlive a rule's validity window.
    fn still_live(rules: Arc<Vec<Rule>>) -> Arc<Vec<Rule>> {
        let now = Utc::now();
        if rules.iter().all(|r| r.is_live(now)) {
            rules
        } else {
            Arc::new(rules.iter().filter(|r| r.is_live(now)).cloned().collect())
        }
    }
}
