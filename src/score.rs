//! Detection aggregation and result types.

use crate::detectors::{DetectionSignal, SignalAction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mean bot-signal confidence above which the request is a bot.
const AVERAGE_BOT_THRESHOLD: f64 = 0.5;
/// A single signal above this confidence makes the request a bot.
const HIGHEST_BOT_THRESHOLD: f64 = 0.8;
const BLOCK_THRESHOLD: f64 = 0.9;
const CHALLENGE_THRESHOLD: f64 = 0.7;
/// Floor applied when the rate valve fires.
const HARD_LIMIT_CONFIDENCE: f64 = 0.9;

/// Combined classification of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub is_bot: bool,
    pub is_ai_bot: bool,

    /// Highest signal confidence (0.0-1.0)
    pub confidence: f64,

    /// Bot identity reported by the most confident signal
    pub bot_type: Option<String>,

    pub action: SignalAction,

    /// Overall risk (0-100)
    /// 0 = no signal of automation, 100 = certain bot
    pub risk_score: u8,

    /// Detectors that flagged the request, in run order
    pub methods: Vec<String>,

    /// Details of the most confident signal
    pub details: HashMap<String, serde_json::Value>,

    /// Every signal that went into the result
    pub signals: Vec<DetectionSignal>,
}

impl DetectionResult {
    /// Signal produced by the named detector, if it ran.
    pub fn signal(&self, method: &str) -> Option<&DetectionSignal> {
        self.signals.iter().find(|s| s.method == method)
    }

    /// Whether a challenge solution was accepted for this request.
    pub fn verified_human(&self) -> bool {
        self.signals.iter().any(|s| s.verified_human)
    }
}

/// Combines detector signals into a [`DetectionResult`].
///
/// A single very confident signal outweighs several weak ones: the action
/// follows the highest confidence, not the average.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionAggregator;

impl DetectionAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn aggregate(&self, signals: Vec<DetectionSignal>) -> DetectionResult {
        let bot_confidences: Vec<f64> = signals
            .iter()
            .filter(|s| s.is_bot)
            .map(|s| s.confidence)
            .collect();

        let average = if bot_confidences.is_empty() {
            0.0
        } else {
            bot_confidences.iter().sum::<f64>() / bot_confidences.len() as f64
        };

        // Strict comparison keeps the earliest signal on ties.
        let mut strongest: Option<&DetectionSignal> = None;
        for signal in &signals {
            if strongest.map_or(true, |best| signal.confidence > best.confidence) {
                strongest = Some(signal);
            }
        }
        let highest = strongest.map_or(0.0, |s| s.confidence);

        let hard_limit = signals.iter().any(|s| s.hard_limit && s.is_bot);
        let verified_human = signals.iter().any(|s| s.verified_human);

        let mut is_bot = !bot_confidences.is_empty()
            && (average > AVERAGE_BOT_THRESHOLD || highest > HIGHEST_BOT_THRESHOLD);
        let mut confidence = highest;

        let action = if hard_limit {
            is_bot = true;
            confidence = confidence.max(HARD_LIMIT_CONFIDENCE);
            SignalAction::Block
        } else if verified_human {
            is_bot = false;
            SignalAction::Allow
        } else if !is_bot {
            SignalAction::Allow
        } else if highest > BLOCK_THRESHOLD {
            SignalAction::Block
        } else if highest > CHALLENGE_THRESHOLD {
            SignalAction::Challenge
        } else {
            SignalAction::Monitor
        };

        let is_ai_bot = is_bot && signals.iter().any(|s| s.is_ai_bot);
        let risk_score = if verified_human && !hard_limit {
            0
        } else {
            (confidence.max(average) * 100.0).round().clamp(0.0, 100.0) as u8
        };

        let (bot_type, details) = match strongest {
            Some(s) => (s.bot_type.clone(), s.details.clone()),
            None => (None, HashMap::new()),
        };
        // Fall back to any identified bot when the strongest signal is anonymous.
        let bot_type = bot_type.or_else(|| {
            if is_bot {
                signals.iter().find_map(|s| s.bot_type.clone())
            } else {
                None
            }
        });

        let methods = signals
            .iter()
            .filter(|s| s.is_bot)
            .map(|s| s.method.clone())
            .collect();

        DetectionResult {
            is_bot,
            is_ai_bot,
            confidence,
            bot_type,
            action,
            risk_score,
            methods,
            details,
            signals,
        }
    }
}
