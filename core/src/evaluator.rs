use crate::outcome::{CheckOutcome, CheckOutcomeIndex};
use crate::rule::{Rule, RuleId};
use serde::Serialize;

/// Fire/no-fire decision for one rule against one outcome snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub rule_id: RuleId,
    pub check_name: String,
    pub fired: bool,
    /// Latest outcome row for the check, if the snapshot has one.
    pub observed: Option<CheckOutcome>,
    pub message: String,
}

impl Evaluation {
    pub fn is_missing_check(&self) -> bool {
        self.observed.is_none()
    }
}

/// Pure trigger logic. No I/O, so results depend only on the rule and the
/// snapshot.
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    pub fn evaluate(rule: &Rule, outcomes: &CheckOutcomeIndex) -> Evaluation {
        let Some(observed) = outcomes.latest(&rule.check_name) else {
            return Evaluation {
                rule_id: rule.id,
                check_name: rule.check_name.clone(),
                fired: false,
                observed: None,
                message: format!(
                    "check '{}' not found in current outcome snapshot",
                    rule.check_name
                ),
            };
        };

        let fired = observed.outcome == rule.desired_outcome;
        let message = if fired {
            format!(
                "check '{}' has outcome '{}', rule triggered",
                rule.check_name, observed.outcome
            )
        } else {
            format!(
                "not triggered: current outcome '{}', desired '{}'",
                observed.outcome, rule.desired_outcome
            )
        };

        Evaluation {
            rule_id: rule.id,
            check_name: rule.check_name.clone(),
            fired,
            observed: Some(observed.clone()),
            message,
        }
    }
}
