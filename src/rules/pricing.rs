//! Price calculation from resolved actions.

use super::model::{ActionType, ExecutableAction};
use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_PRICE_TYPE: &str = "per_request";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    Percentage,
    Flat,
}

impl DiscountKind {
    /// Parse the discount `type` metadata. Anything but a flat/fixed marker
    /// is a percentage.
    fn from_metadata(kind: Option<&str>) -> Self {
        match kind.map(|k| k.to_ascii_lowercase()).as_deref() {
            Some("flat") | Some("fixed") | Some("amount") => DiscountKind::Flat,
            _ => DiscountKind::Percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub rule_id: String,
    pub kind: DiscountKind,
    pub value: f64,
    /// Amount taken off the price
    pub amount: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingMetadata {
    pub original_price: f64,
    pub discounts_applied: usize,
}

/// Final price for a request. `price` is never negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingDecision {
    pub price: f64,
    pub currency: String,
    pub price_type: String,
    pub rule_id: String,
    pub rule_name: String,
    pub discounts: Vec<AppliedDiscount>,
    pub metadata: PricingMetadata,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PricingCalculator;

impl PricingCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Price the request, or `None` without a usable `SetPrice` action.
    pub fn calculate(&self, actions: &[ExecutableAction]) -> Option<PricingDecision> {
        let set_price = actions
            .iter()
            .find(|a| a.action_type() == ActionType::SetPrice)?;

        let original_price = set_price.action.value.as_number();
        if !original_price.is_finite() {
            warn!(rule_id = %set_price.rule_id, "SetPrice value is not a number, skipping pricing");
            return None;
        }
        let original_price = original_price.max(0.0);
        let mut price = original_price;
        let mut discounts = Vec::new();

        if let Some(discount) = actions
            .iter()
            .find(|a| a.action_type() == ActionType::ApplyDiscount)
        {
            let value = discount.action.value.as_number();
            if value.is_finite() {
                let kind = DiscountKind::from_metadata(discount.action.meta_str("type"));
                let before = price;
                price = match kind {
                    DiscountKind::Percentage => price * (1.0 - value.clamp(0.0, 100.0) / 100.0),
                    DiscountKind::Flat => (price - value.max(0.0)).max(0.0),
                };
                discounts.push(AppliedDiscount {
                    rule_id: discount.rule_id.clone(),
                    kind,
                    value,
                    amount: before - price,
                    reason: format!("Discount from rule '{}'", discount.rule_name),
                });
            } else {
                warn!(rule_id = %discount.rule_id, "ApplyDiscount value is not a number, ignoring");
            }
        }

        let currency = set_price
            .action
            .meta_str("currency")
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        let price_type = set_price
            .action
            .meta_str("price_type")
            .unwrap_or(DEFAULT_PRICE_TYPE)
            .to_string();

        Some(PricingDecision {
            price: price.max(0.0),
            currency,
            price_type,
            rule_id: set_price.rule_id.clone(),
            rule_name: set_price.rule_name.clone(),
            metadata: PricingMetadata {
                original_price,
                discounts_applied: discounts.len(),
            },
            discounts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{Action, RuleValue};

    fn bound(action: Action, rule: &str) -> ExecutableAction {
        ExecutableAction {
            action,
            rule_id: rule.to_string(),
            rule_name: format!("{} rule", rule),
            priority: 0,
        }
    }

    #[test]
    fn test_no_set_price() {
        let actions = vec![bound(Action::new(ActionType::BlockAccess, true), "r1")];
        assert!(PricingCalculator::new().calculate(&actions).is_none());
    }

    #[test]
    fn test_percentage_discount() {
        let actions = vec![
            bound(Action::new(ActionType::SetPrice, 1.0), "price"),
            bound(
                Action::new(ActionType::ApplyDiscount, 20.0).with_metadata("type", "percentage"),
                "promo",
            ),
        ];
        let decision = PricingCalculator::new().calculate(&actions).unwrap();
        assert!((decision.price - 0.8).abs() < 1e-9);
        assert_eq!(decision.metadata.discounts_applied, 1);
        assert_eq!(decision.metadata.original_price, 1.0);
        assert_eq!(decision.currency, "USD");
        assert_eq!(decision.rule_id, "price");
        assert!(decision.discounts[0].reason.contains("promo rule"));
    }

    #[test]
    fn test_flat_discount_never_negative() {
        let actions = vec![
            bound(Action::new(ActionType::SetPrice, 0.5), "price"),
            bound(
                Action::new(ActionType::ApplyDiscount, 2.0).with_metadata("type", "fixed"),
                "promo",
            ),
        ];
        let decision = PricingCalculator::new().calculate(&actions).unwrap();
        assert_eq!(decision.price, 0.0);
        assert!((decision.discounts[0].amount - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_price_bounds() {
        let calc = PricingCalculator::new();
        for (price, discount, kind) in [
            (1.0, 150.0, "percentage"),
            (-3.0, 10.0, "percentage"),
            (2.0, -50.0, "flat"),
            (0.0, 0.0, "flat"),
        ] {
            let actions = vec![
                bound(Action::new(ActionType::SetPrice, price), "p"),
                bound(Action::new(ActionType::ApplyDiscount, discount).with_metadata("type", kind), "d"),
            ];
            let decision = calc.calculate(&actions).unwrap();
            assert!(decision.price >= 0.0, "{} {} {}", price, discount, kind);
        }
    }

    #[test]
    fn test_currency_and_type_metadata() {
        let actions = vec![bound(
            Action::new(ActionType::SetPrice, RuleValue::from("0.25"))
                .with_metadata("currency", "eur")
                .with_metadata("price_type", "per_page"),
            "p",
        )];
        let decision = PricingCalculator::new().calculate(&actions).unwrap();
        assert_eq!(decision.price, 0.25);
        assert_eq!(decision.currency, "EUR");
        assert_eq!(decision.price_type, "per_page");
        assert!(decision.discounts.is_empty());
    }

    #[test]
    fn test_non_numeric_price() {
        let actions = vec![bound(Action::new(ActionType::SetPrice, "free"), "p")];
        assert!(PricingCalculator::new().calculate(&actions).is_none());
    }
}
