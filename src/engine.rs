//! Decision facade.
//!
//! [`DecisionEngine::evaluate`] is the single entry point: it runs the
//! detectors, matches the tenant's rules, resolves actions, prices the request
//! and queues an audit event. It never returns an error; failures become an
//! unmatched result with `metadata.error` set.

use crate::audit::{AuditEmitter, AuditEvent, AuditSink, TracingAuditSink};
use crate::cache::{InMemorySharedCache, ResilientCache, SharedCache};
use crate::challenge::{Challenge, ChallengeManager};
use crate::config::EngineConfig;
use crate::detectors::{
    BehavioralTracker, ChallengeDetector, DetectionSignal, Detector, FingerprintMatcher,
    HeuristicScorer, SignalAction, SignatureMatcher,
};
use crate::error::EngineError;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::request::Request;
use crate::rules::{
    ActionResolver, ActionType, ConditionEvaluator, ExecutableAction, PricingCalculator,
    PricingDecision, Rule, RuleSource, RuleStore,
};
use crate::score::{DetectionAggregator, DetectionResult};
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A rule that matched the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub id: String,
    pub name: String,
    pub priority: i64,
}

impl From<&Rule> for MatchedRule {
    fn from(rule: &Rule) -> Self {
        Self {
            id: rule.id.clone(),
            name: rule.name.clone(),
            priority: rule.priority,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetadata {
    pub total_rules_evaluated: usize,
    pub cache_hit: bool,
    /// Rules came from a stale or empty fallback
    #[serde(default)]
    pub rules_degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub matched: bool,
    pub matched_rules: Vec<MatchedRule>,
    pub actions: Vec<ExecutableAction>,
    pub pricing: Option<PricingDecision>,
    pub detection: Option<DetectionResult>,
    /// Challenge the client must solve, when detection asked for one
    pub challenge: Option<Challenge>,
    pub evaluation_time_ms: f64,
    pub metadata: EvaluationMetadata,
}

impl EvaluationResult {
    /// Conservative result for a failed evaluation.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            metadata: EvaluationMetadata {
                error: Some(error.into()),
                ..EvaluationMetadata::default()
            },
            ..Self::default()
        }
    }

    /// Whether any resolved action has this type.
    pub fn has_action(&self, action_type: ActionType) -> bool {
        self.actions.iter().any(|a| a.action_type() == action_type)
    }
}

/// Builder for [`DecisionEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    rule_source: Arc<dyn RuleSource>,
    shared_cache: Option<Arc<dyn SharedCache>>,
    signatures: Option<SignatureMatcher>,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// External shared cache. Calls are wrapped with a timeout and an
    /// in-process fallback.
    pub fn shared_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    pub fn signatures(mut self, signatures: SignatureMatcher) -> Self {
        self.signatures = Some(signatures);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Build the engine. The audit worker needs a Tokio runtime; without
    /// one, auditing is disabled.
    pub fn build(self) -> DecisionEngine {
        let config = self.config;

        let resilient = self.shared_cache.map(|primary| {
            Arc::new(ResilientCache::new(
                primary,
                Duration::from_millis(config.cache.operation_timeout_ms),
                Duration::from_millis(config.cache.breaker_cooldown_ms),
            ))
        });
        let cache: Arc<dyn SharedCache> = match &resilient {
            Some(resilient) => resilient.clone(),
            None => Arc::new(InMemorySharedCache::new()),
        };

        let signatures = Arc::new(self.signatures.unwrap_or_default());
        let challenges = Arc::new(ChallengeManager::new(Arc::clone(&cache), &config.challenge));

        let audit = if config.audit.enabled {
            if tokio::runtime::Handle::try_current().is_ok() {
                let sink = self
                    .audit_sink
                    .unwrap_or_else(|| Arc::new(TracingAuditSink) as Arc<dyn AuditSink>);
                Some(AuditEmitter::spawn(sink, config.audit.drain_on_shutdown))
            } else {
                warn!("No Tokio runtime at engine construction, audit disabled");
                None
            }
        } else {
            None
        };

        info!(
            signatures = signatures.len(),
            cache = cache.name(),
            rpm_threshold = config.behavioral.rpm_threshold,
            audit = audit.is_some(),
            "Decision engine initialized"
        );

        DecisionEngine {
            heuristics: HeuristicScorer::from_config(&config.detection),
            behavioral: BehavioralTracker::new(Arc::clone(&cache), config.behavioral.clone()),
            fingerprint: FingerprintMatcher::new(Arc::clone(&cache)),
            challenge_detector: ChallengeDetector::new(
                Arc::clone(&challenges),
                config.challenge.solution_header.clone(),
            ),
            conditions: ConditionEvaluator::new(Arc::clone(&signatures)),
            rules: RuleStore::new(self.rule_source, &config.rules),
            signatures,
            challenges,
            aggregator: DetectionAggregator::new(),
            resolver: ActionResolver::new(),
            pricing: PricingCalculator::new(),
            audit,
            metrics: EngineMetrics::new(),
            resilient,
            config,
        }
    }
}

/// Request classification and monetization engine.
pub struct DecisionEngine {
    config: EngineConfig,
    signatures: Arc<SignatureMatcher>,
    heuristics: HeuristicScorer,
    behavioral: BehavioralTracker,
    fingerprint: FingerprintMatcher,
    challenge_detector: ChallengeDetector,
    challenges: Arc<ChallengeManager>,
    aggregator: DetectionAggregator,
    rules: RuleStore,
    conditions: ConditionEvaluator,
    resolver: ActionResolver,
    pricing: PricingCalculator,
    audit: Option<AuditEmitter>,
    metrics: EngineMetrics,
    resilient: Option<Arc<ResilientCache>>,
}

impl DecisionEngine {
    pub fn builder(rule_source: Arc<dyn RuleSource>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            rule_source,
            shared_cache: None,
            signatures: None,
            audit_sink: None,
        }
    }

    /// Engine with an in-process cache and default signatures.
    pub fn new(config: EngineConfig, rule_source: Arc<dyn RuleSource>) -> Self {
        Self::builder(rule_source).config(config).build()
    }

    /// Evaluate a request for a tenant within the configured deadline.
    pub async fn evaluate(&self, tenant_id: &str, request: &Request) -> EvaluationResult {
        let deadline = Duration::from_millis(self.config.performance.evaluation_deadline_ms);
        self.evaluate_with_deadline(tenant_id, request, deadline).await
    }

    /// Evaluate with a caller-supplied deadline. Outstanding detector and
    /// rule-store calls are dropped when it expires.
    pub async fn evaluate_with_deadline(
        &self,
        tenant_id: &str,
        request: &Request,
        deadline: Duration,
    ) -> EvaluationResult {
        let started = Instant::now();
        EngineMetrics::incr(&self.metrics.evaluations);

        let pipeline = AssertUnwindSafe(self.run(tenant_id, request)).catch_unwind();
        let mut result = match tokio::time::timeout(deadline, pipeline).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => EvaluationResult::failure(
                EngineError::Internal(panic_message(panic.as_ref())).to_string(),
            ),
            Err(_) => EvaluationResult::failure(
                EngineError::DeadlineExceeded(deadline.as_millis() as u64).to_string(),
            ),
        };
        result.evaluation_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        if result.matched {
            EngineMetrics::incr(&self.metrics.matched);
        }
        if result.detection.is_none() {
            EngineMetrics::incr(&self.metrics.errors);
            error!(
                tenant_id = %tenant_id,
                request_id = %request.id,
                error = result.metadata.error.as_deref().unwrap_or("unknown"),
                "Evaluation failed"
            );
        }

        info!(
            tenant_id = %tenant_id,
            request_id = %request.id,
            matched = result.matched,
            matched_rules = result.matched_rules.len(),
            evaluation_time_ms = result.evaluation_time_ms,
            "Evaluation complete"
        );

        self.emit_audit(tenant_id, request, &result);
        result
    }

    async fn run(&self, tenant_id: &str, request: &Request) -> EvaluationResult {
        let detection = self.detect(request).await;

        let lookup = self.rules.get_active_rules(tenant_id).await;
        if lookup.cache_hit {
            EngineMetrics::incr(&self.metrics.rule_cache_hits);
        } else {
            EngineMetrics::incr(&self.metrics.rule_cache_misses);
        }
        if lookup.degraded {
            EngineMetrics::incr(&self.metrics.degraded_lookups);
        }

        let matched: Vec<&Rule> = lookup
            .rules
            .iter()
            .filter(|rule| self.conditions.matches(request, &detection, rule))
            .collect();
        let actions = self.resolver.resolve(matched.iter().copied());
        let pricing = self.pricing.calculate(&actions);

        let challenge = if detection.action == SignalAction::Challenge {
            self.issue_challenge(request).await
        } else {
            None
        };

        EvaluationResult {
            matched: !matched.is_empty(),
            matched_rules: matched.iter().map(|rule| MatchedRule::from(*rule)).collect(),
            actions,
            pricing,
            detection: Some(detection),
            challenge,
            evaluation_time_ms: 0.0,
            metadata: EvaluationMetadata {
                total_rules_evaluated: lookup.rules.len(),
                cache_hit: lookup.cache_hit,
                rules_degraded: lookup.degraded,
                error: lookup.error.map(|e| EngineError::from(e).to_string()),
            },
        }
    }

    /// Run the enabled detectors concurrently and aggregate their signals.
    pub async fn detect(&self, request: &Request) -> DetectionResult {
        let enabled = &self.config.detection;
        let (signature, heuristic, behavioral, fingerprint, challenge) = tokio::join!(
            run_detector(enabled.signatures, self.signatures.as_ref(), request),
            run_detector(enabled.heuristics, &self.heuristics, request),
            run_detector(enabled.behavioral, &self.behavioral, request),
            run_detector(enabled.fingerprint, &self.fingerprint, request),
            run_detector(enabled.challenge, &self.challenge_detector, request),
        );

        let signals: Vec<DetectionSignal> = [signature, heuristic, behavioral, fingerprint, challenge]
            .into_iter()
            .flatten()
            .collect();

        let result = self.aggregator.aggregate(signals);
        if result.is_bot {
            info!(
                request_id = %request.id,
                client_ip = %request.client_ip,
                bot_type = result.bot_type.as_deref().unwrap_or("unknown"),
                confidence = result.confidence,
                action = result.action.as_str(),
                "Bot detected"
            );
        }
        result
    }

    async fn issue_challenge(&self, request: &Request) -> Option<Challenge> {
        if !self.config.detection.challenge || request.client_ip.is_empty() {
            return None;
        }
        match self.challenges.issue(&request.client_ip).await {
            Ok(challenge) => {
                EngineMetrics::incr(&self.metrics.challenges_issued);
                Some(challenge)
            }
            Err(e) => {
                warn!(error = %EngineError::from(e), "Could not issue challenge");
                None
            }
        }
    }

    /// Drop a tenant's cached rules after they changed upstream.
    pub async fn invalidate_cache(&self, tenant_id: &str) {
        self.rules.invalidate_cache(tenant_id).await;
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            regex_failures: self.conditions.regex_failures(),
            cache_fallbacks: self.resilient.as_ref().map_or(0, |c| c.fallback_count()),
            audit_dropped: self.audit.as_ref().map_or(0, |a| a.dropped()),
            ..self.metrics.snapshot()
        }
    }

    /// Stop the audit worker, draining queued events if configured.
    pub async fn shutdown(&self) {
        if let Some(audit) = &self.audit {
            audit.shutdown().await;
        }
        info!("Decision engine shut down");
    }

    fn emit_audit(&self, tenant_id: &str, request: &Request, result: &EvaluationResult) {
        let Some(audit) = &self.audit else {
            return;
        };
        audit.submit(AuditEvent {
            tenant_id: tenant_id.to_string(),
            request_id: request.id.clone(),
            domain: request.domain.clone(),
            matched: result.matched,
            matched_rule_count: result.matched_rules.len(),
            evaluation_time_ms: result.evaluation_time_ms,
            timestamp: Utc::now(),
            action: result
                .detection
                .as_ref()
                .map(|d| d.action.as_str().to_string()),
            price: result.pricing.as_ref().map(|p| p.price),
            bot_type: result.detection.as_ref().and_then(|d| d.bot_type.clone()),
        });
    }
}

/// Run one detector, isolating panics so a faulty detector cannot abort
/// aggregation.
async fn run_detector(
    enabled: bool,
    detector: &dyn Detector,
    request: &Request,
) -> Option<DetectionSignal> {
    if !enabled {
        return None;
    }

    let signal = match AssertUnwindSafe(detector.analyze(request)).catch_unwind().await {
        Ok(signal) => signal,
        Err(panic) => {
            warn!(
                detector = detector.name(),
                error = %panic_message(panic.as_ref()),
                "Detector panicked"
            );
            DetectionSignal::clean(detector.name())
        }
    };

    debug!(
        detector = detector.name(),
        is_bot = signal.is_bot,
        confidence = signal.confidence,
        "Detector complete"
    );
    Some(signal)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::error::RuleSourceError;
    use crate::rules::{Action, Condition, ConditionType, Operator, StaticRuleSource};
    use crate::test_support::CapturedLogs;

    fn gptbot_request(id: &str) -> Request {
        Request::new(id, "example.com", "https://example.com/article")
            .with_client_ip("198.51.100.1")
            .with_user_agent("Mozilla/5.0 GPTBot/1.0")
    }

    #[tokio::test]
    async fn test_detection_runs_all_enabled_detectors() {
        let engine = DecisionEngine::new(EngineConfig::default(), Arc::new(StaticRuleSource::new()));
        let detection = engine.detect(&gptbot_request("r1")).await;

        let methods: Vec<&str> = detection.signals.iter().map(|s| s.method.as_str()).collect();
        assert_eq!(methods, vec!["signature", "heuristic", "behavioral", "fingerprint", "challenge"]);
        assert_eq!(detection.bot_type.as_deref(), Some("GPTBot"));
    }

    #[tokio::test]
    async fn test_disabled_detectors_are_skipped() {
        let mut config = EngineConfig::default();
        config.detection.behavioral = false;
        config.detection.fingerprint = false;
        let engine = DecisionEngine::new(config, Arc::new(StaticRuleSource::new()));

        let detection = engine.detect(&gptbot_request("r1")).await;
        assert!(detection.signal("behavioral").is_none());
        assert!(detection.signal("fingerprint").is_none());
    }

    #[tokio::test]
    async fn test_audit_event_emitted() {
        let sink = Arc::new(MemoryAuditSink::new());
        let source = StaticRuleSource::with_rules(
            "t1",
            vec![Rule::new("r1", "block gpt", 10)
                .with_condition(Condition::new(ConditionType::BotId, Operator::Contains, "GPT"))
                .with_action(Action::new(ActionType::BlockAccess, true))],
        );
        let engine = DecisionEngine::builder(Arc::new(source))
            .audit_sink(sink.clone())
            .build();

        let result = engine.evaluate("t1", &gptbot_request("req-1")).await;
        assert!(result.matched);
        engine.shutdown().await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id, "req-1");
        assert_eq!(events[0].matched_rule_count, 1);
    }

    struct PanickingDetector;

    #[async_trait::async_trait]
    impl Detector for PanickingDetector {
        async fn analyze(&self, _: &Request) -> DetectionSignal {
            panic!("detector bug")
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_detector_panic_is_isolated() {
        let signal = run_detector(true, &PanickingDetector, &gptbot_request("r1")).await;
        let signal = signal.unwrap();
        assert!(!signal.is_bot);
        assert_eq!(signal.method, "panicking");
    }

    #[test]
    fn test_failure_result() {
        let result = EvaluationResult::failure("boom");
        assert!(!result.matched);
        assert!(result.actions.is_empty());
        assert_eq!(result.metadata.error.as_deref(), Some("boom"));
    }

    struct StalledSource;

    #[async_trait::async_trait]
    impl RuleSource for StalledSource {
        async fn load_active_rules(&self, _: &str) -> Result<Vec<Rule>, RuleSourceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_completed_evaluation_logs_at_info() {
        let (logs, _guard) = CapturedLogs::install();
        let engine = DecisionEngine::new(EngineConfig::default(), Arc::new(StaticRuleSource::new()));

        engine.evaluate("t1", &gptbot_request("r1")).await;

        let line = logs.line_with("Evaluation complete").unwrap();
        assert!(line.contains(" INFO "), "{line}");
    }

    #[tokio::test]
    async fn test_failed_evaluation_logs_at_error() {
        let (logs, _guard) = CapturedLogs::install();
        let engine = DecisionEngine::new(EngineConfig::default(), Arc::new(StalledSource));

        let result = engine
            .evaluate_with_deadline("t1", &gptbot_request("r1"), Duration::from_millis(20))
            .await;
        assert!(result.detection.is_none());

        let line = logs.line_with("Evaluation failed").unwrap();
        assert!(line.contains("ERROR"), "{line}");
    }
}
