//! Configuration types for the decision engine.

use crate::challenge::MAX_DIFFICULTY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the decision engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Detector toggles and thresholds
    pub detection: DetectionConfig,

    /// Behavioral tracking settings
    pub behavioral: BehavioralConfig,

    /// Proof-of-work challenge settings
    pub challenge: ChallengeConfig,

    /// Rule store settings
    pub rules: RuleStoreConfig,

    /// Shared cache settings
    pub cache: CacheConfig,

    /// Performance settings
    pub performance: PerformanceConfig,

    /// Audit emission settings
    pub audit: AuditConfig,
}

impl EngineConfig {
    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.challenge.difficulty <= MAX_DIFFICULTY,
            "challenge.difficulty must be at most {}, got {}",
            MAX_DIFFICULTY,
            self.challenge.difficulty
        );
        anyhow::ensure!(
            self.performance.evaluation_deadline_ms > 0,
            "performance.evaluation_deadline_ms must be positive"
        );
        anyhow::ensure!(
            self.cache.operation_timeout_ms > 0,
            "cache.operation_timeout_ms must be positive"
        );
        Ok(())
    }
}

/// Detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Enable the user-agent signature table
    pub signatures: bool,

    /// Enable header/user-agent heuristics
    pub heuristics: bool,

    /// Enable per-client behavioral tracking
    pub behavioral: bool,

    /// Enable header/transport fingerprint lookup
    pub fingerprint: bool,

    /// Enable proof-of-work verification
    pub challenge: bool,

    /// Heuristic score at or above which a request is a bot (0-95)
    pub heuristic_bot_threshold: u8,

    /// Heuristic score at or above which an AI label makes it an AI bot
    pub heuristic_ai_threshold: u8,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            signatures: true,
            heuristics: true,
            behavioral: true,
            fingerprint: true,
            challenge: true,
            heuristic_bot_threshold: 60,
            heuristic_ai_threshold: 40,
        }
    }
}

/// Behavioral tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralConfig {
    /// Requests per rolling minute above which a client is hard-blocked
    pub rpm_threshold: u32,

    /// Total requests in the window above which suspicion is raised
    pub high_volume_threshold: u64,

    /// Average inter-request interval (ms) considered machine-like
    pub fast_interval_ms: u64,

    /// Minimum requests in the pattern window before timing is judged
    pub min_requests_for_timing: usize,

    /// Distinct user-agents from one client above which suspicion is raised
    pub unique_user_agent_threshold: u64,

    /// TTL of the per-client behavior window in seconds
    pub window_ttl_seconds: u64,

    /// Burst/pattern sub-window in seconds
    pub pattern_window_seconds: u64,
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            rpm_threshold: 60,
            high_volume_threshold: 100,
            fast_interval_ms: 100,
            min_requests_for_timing: 10,
            unique_user_agent_threshold: 5,
            window_ttl_seconds: 3600,
            pattern_window_seconds: 300,
        }
    }
}

/// Challenge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Required leading zero hex digits in the solution digest
    pub difficulty: u8,

    /// Challenge validity in seconds
    pub ttl_seconds: u64,

    /// Request header carrying a client's solution
    pub solution_header: String,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            difficulty: 4,
            ttl_seconds: 300,
            solution_header: "x-pow-solution".to_string(),
        }
    }
}

/// Rule store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleStoreConfig {
    /// Tenant rule cache TTL in seconds
    pub cache_ttl_seconds: u64,

    /// Maximum tenants held in the rule cache
    pub cache_capacity: u64,

    /// Timeout for the rule-management collaborator in milliseconds
    pub source_timeout_ms: u64,

    /// Serve last-known rules when the collaborator fails
    pub serve_stale_on_error: bool,
}

impl Default for RuleStoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            cache_capacity: 10_000,
            source_timeout_ms: 200,
            serve_stale_on_error: true,
        }
    }
}

impl RuleStoreConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

/// Shared cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Per-operation timeout before falling back to the local cache
    pub operation_timeout_ms: u64,

    /// How long to skip the shared backend after it fails
    pub breaker_cooldown_ms: u64,

    /// Redis URL for the shared backend (requires the `redis-cache` feature)
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 100,
            breaker_cooldown_ms: 10_000,
            redis_url: None,
        }
    }
}

/// Performance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Overall deadline for one evaluation in milliseconds
    pub evaluation_deadline_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            evaluation_deadline_ms: 1000,
        }
    }
}

/// Audit emission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Emit an audit event after each evaluation
    pub enabled: bool,

    /// Deliver queued events on shutdown instead of dropping them
    pub drain_on_shutdown: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drain_on_shutdown: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.behavioral.rpm_threshold, 60);
        assert_eq!(config.rules.cache_ttl_seconds, 300);
        assert_eq!(config.challenge.ttl_seconds, 300);
        assert!(config.detection.fingerprint);
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.behavioral.rpm_threshold, config.behavioral.rpm_threshold);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "behavioral:\n  rpm_threshold: 120\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.behavioral.rpm_threshold, 120);
        assert_eq!(config.behavioral.high_volume_threshold, 100);
        assert_eq!(config.rules.source_timeout_ms, 200);
    }

    #[test]
    fn test_validate() {
        assert!(EngineConfig::default().validate().is_ok());

        let mut config = EngineConfig::default();
        config.challenge.difficulty = 65;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("challenge.difficulty"));

        let mut config = EngineConfig::default();
        config.performance.evaluation_deadline_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_breaker_cooldown_default() {
        let config: EngineConfig = serde_yaml::from_str("cache:\n  operation_timeout_ms: 50\n").unwrap();
        assert_eq!(config.cache.operation_timeout_ms, 50);
        assert_eq!(config.cache.breaker_cooldown_ms, 10_000);
    }
}
