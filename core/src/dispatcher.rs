use crate::agent::{Alert, AlertSink, TerminationResponse, WorkflowTerminator};
use crate::error::TransportError;
use crate::evaluator::Evaluation;
use crate::lineage::ImpactIndex;
use crate::metrics::METRICS;
use crate::rule::{Rule, RuleId};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Sent,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStatus {
    NotApplicable,
    Succeeded,
    Failed,
    /// The workflow was already gone; the desired end state holds.
    NotFound,
}

/// Fully resolved outcome of evaluating and dispatching one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerResult {
    pub rule_id: RuleId,
    pub check_name: String,
    pub fired: bool,
    pub alert_status: AlertStatus,
    pub termination_status: TerminationStatus,
    pub message: String,
}

impl TriggerResult {
    /// One action went through and the other failed.
    pub fn is_partial_failure(&self) -> bool {
        let alert_ok = self.alert_status != AlertStatus::Failed;
        let termination_ok = self.termination_status != TerminationStatus::Failed;
        alert_ok != termination_ok
    }
}

/// Maps a termination answer onto a status: 2xx succeeded, 404/410 the
/// workflow is already gone, anything else failed.
pub fn classify_termination(response: &TerminationResponse) -> TerminationStatus {
    match response.status {
        200..=299 => TerminationStatus::Succeeded,
        404 | 410 => TerminationStatus::NotFound,
        _ => TerminationStatus::Failed,
    }
}

/// Executes the side effects of fired rules: the alert, then the optional
/// workflow termination. The two are independent; a failure of one is
/// recorded and the other still runs.
pub struct ActionDispatcher {
    alerts: Arc<dyn AlertSink>,
    terminator: Option<Arc<dyn WorkflowTerminator>>,
    timeout: Duration,
    revalidate_workflows: bool,
}

impl ActionDispatcher {
    pub fn new(alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            alerts,
            terminator: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            revalidate_workflows: true,
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn WorkflowTerminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Timeout applied to each outbound call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// When enabled, a workflow that has dropped out of a loaded impact
    /// index is not terminated.
    pub fn with_workflow_revalidation(mut self, enabled: bool) -> Self {
        self.revalidate_workflows = enabled;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn dispatch(
        &self,
        rule: &Rule,
        evaluation: Evaluation,
        impact: &ImpactIndex,
    ) -> TriggerResult {
        if !evaluation.fired {
            debug!(rule_id = %rule.id, check_name = %rule.check_name, "{}", evaluation.message);
            return TriggerResult {
                rule_id: rule.id,
                check_name: rule.check_name.clone(),
                fired: false,
                alert_status: AlertStatus::Skipped,
                termination_status: TerminationStatus::NotApplicable,
                message: evaluation.message,
            };
        }

        let start = Instant::now();
        info!(
            rule_id = %rule.id,
            check_name = %rule.check_name,
            action = ?rule.action_kind(),
            "Rule triggered"
        );

        let alert = build_alert(rule, &evaluation);
        let mut notes = vec![evaluation.message];

        let (alert_status, alert_note) = self.send_alert(rule, &alert).await;
        notes.push(alert_note);

        let termination_status = match rule.workflow_name() {
            None => TerminationStatus::NotApplicable,
            Some(workflow) => {
                let (status, note) = self.terminate(rule, workflow, impact).await;
                notes.push(note);
                status
            }
        };

        METRICS.record_alert(alert_status);
        METRICS.record_termination(termination_status);
        METRICS.record_dispatch_duration(start.elapsed().as_secs_f64());

        TriggerResult {
            rule_id: rule.id,
            check_name: rule.check_name.clone(),
            fired: true,
            alert_status,
            termination_status,
            message: notes.join("; "),
        }
    }

    async fn send_alert(&self, rule: &Rule, alert: &Alert) -> (AlertStatus, String) {
        let Some(target) = rule.webhook_target() else {
            return (
                AlertStatus::Skipped,
                "no webhook target configured, alert skipped".to_string(),
            );
        };

        match self.bounded(self.alerts.send(target, alert)).await {
            Ok(()) => {
                debug!(rule_id = %rule.id, sink = self.alerts.name(), "Alert sent");
                (
                    AlertStatus::Sent,
                    format!("alert sent via {}", self.alerts.name()),
                )
            }
            Err(e) => {
                warn!(rule_id = %rule.id, sink = self.alerts.name(), error = %e, "Alert failed");
                (AlertStatus::Failed, format!("alert failed: {}", e))
            }
        }
    }

    async fn terminate(
        &self,
        rule: &Rule,
        workflow: &str,
        impact: &ImpactIndex,
    ) -> (TerminationStatus, String) {
        if self.revalidate_workflows && !impact.permits_termination(workflow) {
            warn!(rule_id = %rule.id, workflow = %workflow, "Workflow no longer downstream, not terminating");
            return (
                TerminationStatus::Failed,
                format!(
                    "workflow '{}' is no longer downstream in the current lineage snapshot, termination skipped",
                    workflow
                ),
            );
        }

        let Some(terminator) = &self.terminator else {
            return (
                TerminationStatus::Failed,
                format!("no termination endpoint configured for workflow '{}'", workflow),
            );
        };

        match self.bounded(terminator.terminate(workflow)).await {
            Ok(response) => {
                let status = classify_termination(&response);
                match status {
                    TerminationStatus::Succeeded => {
                        info!(rule_id = %rule.id, workflow = %workflow, "Workflow terminated");
                        (status, format!("successfully deleted workflow: {}", workflow))
                    }
                    TerminationStatus::NotFound => {
                        info!(rule_id = %rule.id, workflow = %workflow, "Workflow already absent");
                        (status, format!("workflow '{}' was already absent", workflow))
                    }
                    _ => {
                        warn!(
                            rule_id = %rule.id,
                            workflow = %workflow,
                            status = response.status,
                            "Workflow termination rejected"
                        );
                        (
                            TerminationStatus::Failed,
                            format!(
                                "failed to delete workflow '{}'. Status: {}, Details: {}",
                                workflow, response.status, response.body
                            ),
                        )
                    }
                }
            }
            Err(e) => {
                warn!(rule_id = %rule.id, workflow = %workflow, error = %e, "Workflow termination failed");
                (
                    TerminationStatus::Failed,
                    format!("failed to delete workflow '{}': {}", workflow, e),
                )
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

fn build_alert(rule: &Rule, evaluation: &Evaluation) -> Alert {
    let (outcome, table_name, definition) = match &evaluation.observed {
        Some(row) => (row.outcome, row.table_name.clone(), row.definition.clone()),
        None => (rule.desired_outcome, String::new(), String::new()),
    };
    Alert {
        rule_id: rule.id,
        check_name: rule.check_name.clone(),
        table_name,
        outcome,
        definition,
        text: Alert::default_text(&rule.check_name, outcome),
    }
}
