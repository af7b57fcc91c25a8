//! Bot detection modules.
//!
//! Each detector inspects one aspect of the request and returns an
//! independent [`DetectionSignal`]. Detectors never fail: internal faults are
//! reported as a non-bot, zero-confidence signal.

pub mod behavioral;
pub mod challenge;
pub mod fingerprint;
pub mod heuristics;
pub mod signatures;

pub use behavioral::BehavioralTracker;
pub use challenge::ChallengeDetector;
pub use fingerprint::FingerprintMatcher;
pub use heuristics::HeuristicScorer;
pub use signatures::SignatureMatcher;

use crate::request::Request;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Action a detector (or the aggregate) suggests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    #[default]
    Allow,
    Block,
    Challenge,
    Monitor,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Allow => "allow",
            SignalAction::Block => "block",
            SignalAction::Challenge => "challenge",
            SignalAction::Monitor => "monitor",
        }
    }
}

/// One detector's verdict on a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSignal {
    /// Detector that produced this signal
    pub method: String,
    pub is_bot: bool,
    /// Confidence in the verdict (0.0-1.0)
    pub confidence: f64,
    pub action: SignalAction,
    pub bot_type: Option<String>,
    /// Whether the detector attributes the traffic to an AI agent
    #[serde(default)]
    pub is_ai_bot: bool,
    /// Rate safety valve: forces a block regardless of other signals
    #[serde(default)]
    pub hard_limit: bool,
    /// Client solved a challenge for this request
    #[serde(default)]
    pub verified_human: bool,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl DetectionSignal {
    /// A signal that does not flag the request.
    pub fn clean(method: impl Into<String>) -> Self {
        Self::new(method, false, 0.0, SignalAction::Allow)
    }

    /// A signal flagging the request as a bot.
    pub fn bot(method: impl Into<String>, confidence: f64, action: SignalAction) -> Self {
        Self::new(method, true, confidence, action)
    }

    pub fn new(
        method: impl Into<String>,
        is_bot: bool,
        confidence: f64,
        action: SignalAction,
    ) -> Self {
        Self {
            method: method.into(),
            is_bot,
            confidence: confidence.clamp(0.0, 1.0),
            action,
            bot_type: None,
            is_ai_bot: false,
            hard_limit: false,
            verified_human: false,
            details: HashMap::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_bot_type(mut self, bot_type: impl Into<String>) -> Self {
        self.bot_type = Some(bot_type.into());
        self
    }

    pub fn with_ai_bot(mut self, is_ai_bot: bool) -> Self {
        self.is_ai_bot = is_ai_bot;
        self
    }

    pub fn with_hard_limit(mut self) -> Self {
        self.hard_limit = true;
        self
    }

    pub fn with_verified_human(mut self) -> Self {
        self.verified_human = true;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Numeric detail, if present.
    pub fn detail_f64(&self, key: &str) -> Option<f64> {
        self.details.get(key).and_then(|v| v.as_f64())
    }
}

/// Trait for bot detectors.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Analyze the request and return a signal.
    async fn analyze(&self, request: &Request) -> DetectionSignal;

    /// Get the detector name.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        let signal = DetectionSignal::bot("test", 1.7, SignalAction::Block);
        assert_eq!(signal.confidence, 1.0);

        let signal = DetectionSignal::clean("test").with_confidence(-0.5);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_details() {
        let signal = DetectionSignal::clean("behavioral")
            .with_detail("request_count", 12)
            .with_detail("label", "burst");
        assert_eq!(signal.detail_f64("request_count"), Some(12.0));
        assert_eq!(signal.detail_f64("label"), None);
        assert_eq!(signal.detail_f64("missing"), None);
    }

    #[test]
    fn test_action_serialization() {
        assert_eq!(serde_json::to_string(&SignalAction::Challenge).unwrap(), "\"challenge\"");
        assert_eq!(SignalAction::Monitor.as_str(), "monitor");
    }
}
