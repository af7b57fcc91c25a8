//! Rule-management collaborator interface.

use super::model::Rule;
use crate::error::RuleSourceError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Read-only view of tenant rules owned by an external system.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Load the tenant's rules. Implementations may return inactive or
    /// expired rules; the store filters them.
    async fn load_active_rules(&self, tenant_id: &str) -> Result<Vec<Rule>, RuleSourceError>;
}

/// In-process rule source backed by a map.
///
/// Used by the CLI and tests; production deployments implement
/// [`RuleSource`] over their rule database.
#[derive(Default)]
pub struct StaticRuleSource {
    tenants: DashMap<String, Vec<Rule>>,
    loads: AtomicU64,
}

impl StaticRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source holding a single tenant's rules.
    pub fn with_rules(tenant_id: impl Into<String>, rules: Vec<Rule>) -> Self {
        let source = Self::new();
        source.set_rules(tenant_id, rules);
        source
    }

    /// Load rules from a JSON file.
    ///
    /// Accepts either a map of tenant id to rules, or a bare rule list which
    /// is assigned to `default_tenant`.
    pub fn from_file(path: &Path, default_tenant: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let source = Self::new();
        if value.is_array() {
            let rules: Vec<Rule> = serde_json::from_value(value)?;
            source.set_rules(default_tenant, rules);
        } else {
            let tenants: HashMap<String, Vec<Rule>> = serde_json::from_value(value)?;
            for (tenant, rules) in tenants {
                source.set_rules(tenant, rules);
            }
        }
        Ok(source)
    }

    /// Replace a tenant's rules.
    pub fn set_rules(&self, tenant_id: impl Into<String>, rules: Vec<Rule>) {
        self.tenants.insert(tenant_id.into(), rules);
    }

    /// Number of loads served so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    async fn load_active_rules(&self, tenant_id: &str) -> Result<Vec<Rule>, RuleSourceError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|rules| rules.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticRuleSource::with_rules("t1", vec![Rule::new("r1", "one", 1)]);
        assert_eq!(source.load_active_rules("t1").await.unwrap().len(), 1);
        assert!(source.load_active_rules("t2").await.unwrap().is_empty());
        assert_eq!(source.load_count(), 2);
    }

    #[test]
    fn test_from_file_formats() {
        let dir = tempfile::tempdir().unwrap();

        let list = dir.path().join("list.json");
        std::fs::write(&list, r#"[{"id": "r1", "name": "one"}]"#).unwrap();
        let source = StaticRuleSource::from_file(&list, "t1").unwrap();
        assert!(source.tenants.contains_key("t1"));

        let map = dir.path().join("map.json");
        std::fs::write(&map, r#"{"a": [{"id": "r1", "name": "one"}], "b": []}"#).unwrap();
        let source = StaticRuleSource::from_file(&map, "t1").unwrap();
        assert!(source.tenants.contains_key("a"));
        assert!(source.tenants.contains_key("b"));
        assert!(!source.tenants.contains_key("t1"));
    }
}
