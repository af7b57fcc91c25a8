//! Tenant rules: model, storage, matching, action resolution and pricing.

pub mod actions;
pub mod conditions;
pub mod model;
pub mod pricing;
pub mod source;
pub mod store;

pub use actions::ActionResolver;
pub use conditions::ConditionEvaluator;
pub use model::{
    Action, ActionType, Condition, ConditionType, ExecutableAction, Operator, Rule, RuleValue,
};
pub use pricing::{AppliedDiscount, DiscountKind, PricingCalculator, PricingDecision};
pub use source::{RuleSource, StaticRuleSource};
pub use store::{RuleLookup, RuleStore};
