//! Action resolution across matched rules.

use super::model::{ActionType, ExecutableAction, Rule};
use std::collections::HashSet;

/// Picks one action per type, taking each from the highest-priority rule
/// that declares it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionResolver;

impl ActionResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve actions from `rules`, which must already be in evaluation
    /// order (priority descending, stable tie-break).
    pub fn resolve<'a, I>(&self, rules: I) -> Vec<ExecutableAction>
    where
        I: IntoIterator<Item = &'a Rule>,
    {
        let mut claimed: HashSet<ActionType> = HashSet::new();
        let mut resolved = Vec::new();

        for rule in rules {
            for action in &rule.actions {
                if claimed.insert(action.action_type) {
                    resolved.push(ExecutableAction {
                        action: action.clone(),
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        priority: rule.priority,
                    });
                }
            }
        }

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::Action;

    #[test]
    fn test_highest_priority_wins_per_type() {
        let rules = vec![
            Rule::new("high", "High", 100).with_action(Action::new(ActionType::SetPrice, 0.01)),
            Rule::new("low", "Low", 50)
                .with_action(Action::new(ActionType::SetPrice, 5.0))
                .with_action(Action::new(ActionType::RateLimit, 10.0)),
        ];

        let actions = ActionResolver::new().resolve(&rules);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_type(), ActionType::SetPrice);
        assert_eq!(actions[0].rule_id, "high");
        assert_eq!(actions[1].action_type(), ActionType::RateLimit);
        assert_eq!(actions[1].rule_id, "low");
    }

    #[test]
    fn test_duplicate_types_within_rule() {
        let rules = vec![Rule::new("r1", "Twice", 1)
            .with_action(Action::new(ActionType::SetPrice, 1.0))
            .with_action(Action::new(ActionType::SetPrice, 2.0))];

        let actions = ActionResolver::new().resolve(&rules);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action.value.as_number(), 1.0);
    }

    #[test]
    fn test_no_rules() {
        let rules: Vec<Rule> = Vec::new();
        assert!(ActionResolver::new().resolve(&rules).is_empty());
    }
}
