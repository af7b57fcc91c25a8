//! Rule data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A condition or action operand.
///
/// Coercion rules live on the accessors: [`RuleValue::as_text`],
/// [`RuleValue::as_number`] and [`RuleValue::as_list`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
    #[default]
    Null,
}

impl RuleValue {
    /// String form; `None` for null.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RuleValue::Text(s) => Some(s.clone()),
            RuleValue::Number(n) => Some(format_number(*n)),
            RuleValue::Bool(b) => Some(b.to_string()),
            RuleValue::List(items) => Some(items.join(",")),
            RuleValue::Null => None,
        }
    }

    /// Numeric form; NaN when the value is not a number.
    pub fn as_number(&self) -> f64 {
        match self {
            RuleValue::Number(n) => *n,
            RuleValue::Text(s) => s.trim().parse().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    /// List form. Strings are split on commas.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            RuleValue::List(items) => items.iter().map(|s| s.trim().to_string()).collect(),
            RuleValue::Text(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            RuleValue::Null => Vec::new(),
            other => other.as_text().into_iter().collect(),
        }
    }

    /// Null, empty string or empty list.
    pub fn is_empty(&self) -> bool {
        match self {
            RuleValue::Null => true,
            RuleValue::Text(s) => s.is_empty(),
            RuleValue::List(items) => items.is_empty(),
            _ => false,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<&str> for RuleValue {
    fn from(s: &str) -> Self {
        RuleValue::Text(s.to_string())
    }
}

impl From<String> for RuleValue {
    fn from(s: String) -> Self {
        RuleValue::Text(s)
    }
}

impl From<f64> for RuleValue {
    fn from(n: f64) -> Self {
        RuleValue::Number(n)
    }
}

impl From<bool> for RuleValue {
    fn from(b: bool) -> Self {
        RuleValue::Bool(b)
    }
}

impl From<Vec<String>> for RuleValue {
    fn from(items: Vec<String>) -> Self {
        RuleValue::List(items)
    }
}

/// What a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    BotId,
    UserAgent,
    ContentType,
    IpAddress,
    Referer,
    Domain,
    UrlPattern,
    TimeOfDay,
    DayOfWeek,
    RequestFrequency,
    RequestCount,
    Geography,
    #[serde(other)]
    Unknown,
}

/// How a condition compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    In,
    NotIn,
    Regex,
    IsEmpty,
    IsNotEmpty,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub operator: Operator,
    #[serde(default)]
    pub value: RuleValue,
}

impl Condition {
    pub fn new(condition_type: ConditionType, operator: Operator, value: impl Into<RuleValue>) -> Self {
        Self {
            condition_type,
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    BlockAccess,
    SetPrice,
    ApplyDiscount,
    RateLimit,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::BlockAccess => "block_access",
            ActionType::SetPrice => "set_price",
            ActionType::ApplyDiscount => "apply_discount",
            ActionType::RateLimit => "rate_limit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub value: RuleValue,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Action {
    pub fn new(action_type: ActionType, value: impl Into<RuleValue>) -> Self {
        Self {
            action_type,
            value: value.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// String metadata entry.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// A tenant-owned pricing/access rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Higher is evaluated first
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl Rule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            conditions: Vec::new(),
            actions: Vec::new(),
            priority,
            active: true,
            valid_from: None,
            valid_until: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_validity(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_until = valid_until;
        self
    }

    /// Active and inside its validity window at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.valid_from.map_or(true, |from| from <= now)
            && self.valid_until.map_or(true, |until| now < until)
    }
}

/// An action bound to the rule that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableAction {
    #[serde(flatten)]
    pub action: Action,
    pub rule_id: String,
    pub rule_name: String,
    pub priority: i64,
}

impl ExecutableAction {
    pub fn action_type(&self) -> ActionType {
        self.action.action_type
    }
}
