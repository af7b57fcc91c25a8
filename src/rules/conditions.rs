//! Rule condition evaluation.
//!
//! All conditions of a rule must hold for it to match. Malformed values and
//! bad patterns make a condition false; nothing here returns an error.

use super::model::{Condition, ConditionType, Operator, Rule, RuleValue};
use crate::detectors::SignatureMatcher;
use crate::request::Request;
use crate::score::DetectionResult;
use chrono::{Datelike, Timelike, Weekday};
use dashmap::DashMap;
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Compiled patterns kept before the memo is reset.
const MAX_CACHED_PATTERNS: usize = 1024;

pub struct ConditionEvaluator {
    signatures: Arc<SignatureMatcher>,
    patterns: DashMap<String, Option<Regex>>,
    regex_failures: AtomicU64,
}

impl ConditionEvaluator {
    pub fn new(signatures: Arc<SignatureMatcher>) -> Self {
        Self {
            signatures,
            patterns: DashMap::new(),
            regex_failures: AtomicU64::new(0),
        }
    }

    /// Whether every condition of `rule` holds.
    pub fn matches(&self, request: &Request, detection: &DetectionResult, rule: &Rule) -> bool {
        rule.conditions
            .iter()
            .all(|condition| self.evaluate(condition, request, detection))
    }

    /// Regex conditions that failed to compile so far.
    pub fn regex_failures(&self) -> u64 {
        self.regex_failures.load(Ordering::Relaxed)
    }

    pub fn evaluate(&self, condition: &Condition, request: &Request, detection: &DetectionResult) -> bool {
        if condition.condition_type == ConditionType::Unknown {
            warn!("Unknown condition type, treating as non-match");
            return false;
        }

        let actual = self.extract(condition.condition_type, request, detection);
        let is_ip = condition.condition_type == ConditionType::IpAddress;
        self.apply(condition.operator, &actual, &condition.value, is_ip)
    }

    fn extract(
        &self,
        condition_type: ConditionType,
        request: &Request,
        detection: &DetectionResult,
    ) -> RuleValue {
        let text = |s: Option<&str>| s.map_or(RuleValue::Null, RuleValue::from);
        let behavioral = |key: &str| {
            detection
                .signal("behavioral")
                .and_then(|s| s.detail_f64(key))
                .map_or(RuleValue::Null, RuleValue::Number)
        };

        match condition_type {
            ConditionType::BotId => match &detection.bot_type {
                Some(bot) => RuleValue::from(bot.as_str()),
                None => text(
                    self.signatures
                        .identify(request.user_agent())
                        .map(|sig| sig.bot_name.as_str()),
                ),
            },
            ConditionType::UserAgent => RuleValue::from(request.user_agent()),
            ConditionType::ContentType => text(
                request
                    .content_type
                    .as_deref()
                    .or_else(|| request.header("content-type")),
            ),
            ConditionType::IpAddress => RuleValue::from(request.client_ip.as_str()),
            ConditionType::Referer => text(request.referer()),
            ConditionType::Domain => RuleValue::from(request.domain.as_str()),
            ConditionType::UrlPattern => RuleValue::from(request.url.as_str()),
            ConditionType::TimeOfDay => RuleValue::Number(f64::from(request.timestamp.hour())),
            ConditionType::DayOfWeek => RuleValue::from(weekday_name(request.timestamp.weekday())),
            ConditionType::RequestFrequency => behavioral("requests_per_minute"),
            ConditionType::RequestCount => behavioral("request_count"),
            ConditionType::Geography => text(
                request
                    .metadata
                    .get("country")
                    .and_then(|v| v.as_str())
                    .or_else(|| request.header("cf-ipcountry")),
            ),
            ConditionType::Unknown => RuleValue::Null,
        }
    }

    fn apply(&self, operator: Operator, actual: &RuleValue, expected: &RuleValue, is_ip: bool) -> bool {
        match operator {
            Operator::IsEmpty => return actual.is_empty(),
            Operator::IsNotEmpty => return !actual.is_empty(),
            Operator::GreaterThan => return actual.as_number() > expected.as_number(),
            Operator::LessThan => return actual.as_number() < expected.as_number(),
            Operator::GreaterOrEqual => return actual.as_number() >= expected.as_number(),
            Operator::LessOrEqual => return actual.as_number() <= expected.as_number(),
            Operator::Unknown => {
                warn!("Unknown condition operator, treating as non-match");
                return false;
            }
            _ => {}
        }

        // Missing values satisfy only the negated string operators.
        let Some(actual) = actual.as_text() else {
            return matches!(operator, Operator::NotEquals | Operator::NotContains | Operator::NotIn);
        };
        let actual_lower = actual.to_lowercase();
        let expected_lower = expected.as_text().unwrap_or_default().to_lowercase();

        match operator {
            Operator::Equals => equals(&actual_lower, &expected_lower, is_ip),
            Operator::NotEquals => !equals(&actual_lower, &expected_lower, is_ip),
            Operator::Contains => actual_lower.contains(&expected_lower),
            Operator::NotContains => !actual_lower.contains(&expected_lower),
            Operator::StartsWith => actual_lower.starts_with(&expected_lower),
            Operator::EndsWith => actual_lower.ends_with(&expected_lower),
            Operator::In => in_list(&actual_lower, expected, is_ip),
            Operator::NotIn => !in_list(&actual_lower, expected, is_ip),
            Operator::Regex => self
                .compiled(&expected.as_text().unwrap_or_default())
                .is_some_and(|re| re.is_match(&actual)),
            _ => false,
        }
    }

    /// Memoized case-insensitive regex; `None` if the pattern is invalid.
    fn compiled(&self, pattern: &str) -> Option<Regex> {
        if let Some(entry) = self.patterns.get(pattern) {
            if entry.is_none() {
                self.regex_failures.fetch_add(1, Ordering::Relaxed);
            }
            return entry.value().clone();
        }

        let compiled = match Regex::new(&format!("(?i){}", pattern)) {
            Ok(re) => Some(re),
            Err(e) => {
                self.regex_failures.fetch_add(1, Ordering::Relaxed);
                debug!(pattern = %pattern, error = %e, "Invalid condition regex");
                None
            }
        };

        if self.patterns.len() >= MAX_CACHED_PATTERNS {
            self.patterns.clear();
        }
        self.patterns.insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

fn equals(actual: &str, expected: &str, is_ip: bool) -> bool {
    if is_ip && expected.contains('/') {
        return ip_in_network(actual, expected);
    }
    actual == expected
}

fn in_list(actual_lower: &str, expected: &RuleValue, is_ip: bool) -> bool {
    expected
        .as_list()
        .iter()
        .any(|item| equals(actual_lower, &item.to_lowercase(), is_ip))
}

fn ip_in_network(ip: &str, network: &str) -> bool {
    match (ip.parse::<IpAddr>(), network.parse::<IpNet>()) {
        (Ok(ip), Ok(net)) => net.contains(&ip),
        _ => false,
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}
