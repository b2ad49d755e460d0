use crate::error::TransportError;
use crate::outcome::Outcome;
use crate::rule::RuleId;
use async_trait::async_trait;
use serde::Serialize;

/// Alert produced by a fired rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub rule_id: RuleId,
    pub check_name: String,
    pub table_name: String,
    pub outcome: Outcome,
    pub definition: String,
    /// Default alert text; sinks may render their own from the fields above.
    pub text: String,
}

impl Alert {
    pub fn default_text(check_name: &str, outcome: Outcome) -> String {
        format!(
            "Check '{}' has outcome '{}', rule triggered.",
            check_name, outcome
        )
    }
}

/// Delivers alerts to a per-rule destination.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, target: &str, alert: &Alert) -> Result<(), TransportError>;
}

/// Raw answer of the workflow service to a termination request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationResponse {
    pub status: u16,
    pub body: String,
}

/// Deletes a downstream workflow. Implementations return any HTTP answer as
/// `Ok`; classification into succeeded/not-found/failed is the
/// dispatcher's job.
#[async_trait]
pub trait WorkflowTerminator: Send + Sync {
    fn name(&self) -> &str;
    async fn terminate(&self, workflow_name: &str) -> Result<TerminationResponse, TransportError>;
}
