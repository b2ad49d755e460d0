use crate::error::ValidationError;
use crate::lineage::ImpactIndex;
use crate::outcome::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Stable identity of a rule. Removal and replacement are keyed by it,
/// never by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Uuid);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RuleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AlertOnly,
    AlertAndTerminate,
}

/// What a fired rule does. The workflow to terminate only exists on the
/// variant that terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    AlertOnly,
    AlertAndTerminate { workflow_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub id: RuleId,
    pub check_name: String,
    pub desired_outcome: Outcome,
    pub action: RuleAction,
    pub webhook_target: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub fn action_kind(&self) -> ActionKind {
        match self.action {
            RuleAction::AlertOnly => ActionKind::AlertOnly,
            RuleAction::AlertAndTerminate { .. } => ActionKind::AlertAndTerminate,
        }
    }

    pub fn workflow_name(&self) -> Option<&str> {
        match &self.action {
            RuleAction::AlertOnly => None,
            RuleAction::AlertAndTerminate { workflow_name } => Some(workflow_name),
        }
    }

    /// Webhook URL, or `None` when no destination is configured.
    pub fn webhook_target(&self) -> Option<&str> {
        self.webhook_target
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Unvalidated rule as submitted by a user or a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub check_name: String,
    pub desired_outcome: Outcome,
    pub action: ActionKind,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub webhook_target: Option<String>,
}

impl RuleSpec {
    pub fn alert_only(check_name: impl Into<String>, desired_outcome: Outcome) -> Self {
        Self {
            check_name: check_name.into(),
            desired_outcome,
            action: ActionKind::AlertOnly,
            workflow_name: None,
            webhook_target: None,
        }
    }

    pub fn alert_and_terminate(
        check_name: impl Into<String>,
        desired_outcome: Outcome,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            desired_outcome,
            action: ActionKind::AlertAndTerminate,
            workflow_name: Some(workflow_name.into()),
            webhook_target: None,
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_target = Some(url.into());
        self
    }

    /// Validates the spec into a rule with a fresh id.
    ///
    /// The workflow of a terminating rule is checked against `impact` only
    /// when a lineage snapshot has been loaded. A loaded snapshot with no
    /// downstream workflows rejects every terminating rule.
    pub fn validate(self, impact: &ImpactIndex) -> Result<Rule, ValidationError> {
        self.validate_with_id(RuleId::new(), impact)
    }

    pub fn validate_with_id(self, id: RuleId, impact: &ImpactIndex) -> Result<Rule, ValidationError> {
        let check_name = self.check_name.trim().to_string();
        if check_name.is_empty() {
            return Err(ValidationError::EmptyCheckName);
        }

        let webhook_target = self
            .webhook_target
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let action = match self.action {
            ActionKind::AlertOnly => RuleAction::AlertOnly,
            ActionKind::AlertAndTerminate => {
                let workflow_name = self
                    .workflow_name
                    .map(|wf| wf.trim().to_string())
                    .filter(|wf| !wf.is_empty())
                    .ok_or(ValidationError::MissingWorkflow)?;
                if !impact.permits_termination(&workflow_name) {
                    return Err(ValidationError::UnknownWorkflow(workflow_name));
                }
                RuleAction::AlertAndTerminate { workflow_name }
            }
        };

        Ok(Rule {
            id,
            check_name,
            desired_outcome: self.desired_outcome,
            action,
            webhook_target,
            created_at: Utc::now(),
        })
    }
}

/// Insertion-ordered rule collection.
///
/// Writers publish a new `Arc<Vec<Rule>>`; readers hold whatever version
/// they listed, so a caller iterating a listing never sees it change.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: RwLock<Arc<Vec<Rule>>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rule: Rule) -> RuleId {
        let id = rule.id;
        let mut guard = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(rule);
        *guard = Arc::new(next);
        id
    }

    pub fn remove(&self, id: RuleId) -> bool {
        let mut guard = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<Rule> = guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    /// Replaces the rule with `id`, keeping its position. The replacement
    /// takes over the id.
    pub fn replace(&self, id: RuleId, mut rule: Rule) -> bool {
        rule.id = id;
        let mut guard = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = guard.iter().position(|r| r.id == id) else {
            return false;
        };
        let mut next: Vec<Rule> = guard.iter().cloned().collect();
        next[pos] = rule;
        *guard = Arc::new(next);
        true
    }

    pub fn get(&self, id: RuleId) -> Option<Rule> {
        self.list().iter().find(|r| r.id == id).cloned()
    }

    /// Point-in-time listing in insertion order.
    pub fn list(&self) -> Arc<Vec<Rule>> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list().is_empty()
    }
}
