//! # dq_guard_core - Incident Rule Engine
//!
//! Reacts to data-quality check outcomes. Rules name a check and the outcome
//! that should trigger them; when the latest outcome matches, the engine
//! sends an alert and can terminate the workflows feeding downstream
//! datasets, as computed from a lineage graph.
//!
//! ## Quick Start
//!
//! ```no_run
//! use dq_guard_core::{IncidentEngine, dispatcher::ActionDispatcher};
//! use dq_guard_core::agent::{Alert, AlertSink};
//! use dq_guard_core::error::TransportError;
//! use std::sync::Arc;
//!
//! struct Stdout;
//!
//! #[async_trait::async_trait]
//! impl AlertSink for Stdout {
//!     fn name(&self) -> &str { "stdout" }
//!     async fn send(&self, _target: &str, alert: &Alert) -> Result<(), TransportError> {
//!         println!("{}", alert.text);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = IncidentEngine::new(ActionDispatcher::new(Arc::new(Stdout)));
//! // Attach sources, refresh, add rules...
//! for result in engine.evaluate_all().await {
//!     println!("{}: {}", result.check_name, result.message);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Snapshots of lineage and outcomes are swapped whole on refresh, so an
//! evaluation always runs against one coherent point in time.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod health;
pub mod lineage;
pub mod metrics;
pub mod observability;
pub mod outcome;
pub mod rule;
pub mod source;
pub mod state;

use crate::dispatcher::{ActionDispatcher, AlertStatus, TerminationStatus, TriggerResult};
use crate::error::{EngineError, EngineResult, FetchError};
use crate::evaluator::{Evaluation, TriggerEvaluator};
use crate::lineage::{LineageGraph, LineageGraphParser};
use crate::metrics::METRICS;
use crate::observability::{AuditEvent, AuditEventType, AuditLog};
use crate::outcome::CheckOutcomeIndex;
use crate::rule::{Rule, RuleId, RuleSpec, RuleStore};
use crate::source::{LineageSource, OutcomeBatch, OutcomeSource};
use crate::state::{Snapshot, SnapshotState};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use crate::dispatcher::DEFAULT_REQUEST_TIMEOUT;

pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 4;

/// Orchestrates rules, snapshots and dispatch for one session.
pub struct IncidentEngine {
    rules: RuleStore,
    state: SnapshotState,
    dispatcher: ActionDispatcher,
    lineage_source: Option<Arc<dyn LineageSource>>,
    outcome_source: Option<Arc<dyn OutcomeSource>>,
    table_filter: Option<String>,
    concurrency: usize,
    audit: Option<AuditLog>,
}

impl IncidentEngine {
    pub fn new(dispatcher: ActionDispatcher) -> Self {
        Self {
            rules: RuleStore::new(),
            state: SnapshotState::new(),
            dispatcher,
            lineage_source: None,
            outcome_source: None,
            table_filter: None,
            concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            audit: None,
        }
    }

    pub fn with_lineage_source(mut self, source: Arc<dyn LineageSource>) -> Self {
        self.lineage_source = Some(source);
        self
    }

    pub fn with_outcome_source(mut self, source: Arc<dyn OutcomeSource>) -> Self {
        self.outcome_source = Some(source);
        self
    }

    /// Keep only outcome rows for this table.
    pub fn with_table_filter(mut self, table: impl Into<String>) -> Self {
        self.table_filter = Some(table.into());
        self
    }

    /// Upper bound on rules dispatched at once by `evaluate_all`.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.state.load()
    }

    pub fn audit_log(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    /// Builds both indexes from already-fetched data and publishes them as
    /// the current snapshot. Without a graph the impact index is empty.
    pub fn load_snapshot(&self, batch: OutcomeBatch, lineage: Option<&LineageGraph>) -> Arc<Snapshot> {
        let OutcomeBatch { mut rows, ranked } = batch;

        if let Some(table) = &self.table_filter {
            rows.retain(|row| &row.table_name == table);
        }

        let outcomes = CheckOutcomeIndex::build(rows.iter().cloned());
        if ranked && outcomes.superseded_rows() > 0 {
            warn!(
                duplicates = outcomes.superseded_rows(),
                "Ranked outcome batch still had several rows per check, keeping the latest"
            );
        }

        let impact = lineage.map(LineageGraphParser::parse).unwrap_or_default();
        if lineage.is_some() && impact.is_empty() {
            info!("No downstream workflow impact found in lineage graph");
        }

        let snapshot = self.state.publish(outcomes, impact, rows);
        info!(
            version = snapshot.version,
            checks = snapshot.outcomes.len(),
            workflows = snapshot.impact.len(),
            "Snapshot published"
        );
        snapshot
    }

    /// Fetches lineage and outcomes and swaps the snapshot. If either fetch
    /// fails the previous snapshot stays current and the error is returned.
    pub async fn refresh(&self) -> EngineResult<Arc<Snapshot>> {
        let outcome_source = self
            .outcome_source
            .as_ref()
            .ok_or_else(|| EngineError::Config("no outcome source configured".to_string()))?;

        let lineage_fetch = async {
            match &self.lineage_source {
                Some(source) => source.fetch().await.map(Some),
                None => Ok(None),
            }
        };
        let (lineage, outcomes) = tokio::join!(lineage_fetch, outcome_source.fetch());

        let (graph, batch) = match (lineage, outcomes) {
            (Ok(graph), Ok(batch)) => (graph, batch),
            (Err(e), _) | (_, Err(e)) => return Err(self.refresh_failed(e).await),
        };

        let snapshot = self.load_snapshot(batch, graph.as_ref());
        METRICS.record_refresh(true);
        self.record(
            AuditEvent::new(AuditEventType::SnapshotRefreshed, "snapshot refreshed").with_metadata(
                serde_json::json!({
                    "version": snapshot.version,
                    "checks": snapshot.outcomes.len(),
                    "workflows": snapshot.impact.len(),
                }),
            ),
        )
        .await;
        Ok(snapshot)
    }

    async fn refresh_failed(&self, error: FetchError) -> EngineError {
        warn!(error = %error, "Refresh failed, keeping previous snapshot");
        METRICS.record_refresh(false);
        self.record(AuditEvent::new(AuditEventType::RefreshFailed, error.to_string()))
            .await;
        EngineError::Fetch(error)
    }

    /// Validates `spec` against the current impact index and stores it.
    pub async fn add_rule(&self, spec: RuleSpec) -> EngineResult<RuleId> {
        let rule = spec.validate(&self.snapshot().impact)?;
        let id = self.rules.add(rule.clone());
        info!(rule_id = %id, check_name = %rule.check_name, "Rule added");
        self.record(
            AuditEvent::new(AuditEventType::RuleCreated, "rule created")
                .with_rule(id, &rule.check_name),
        )
        .await;
        Ok(id)
    }

    pub async fn remove_rule(&self, id: RuleId) -> EngineResult<()> {
        if !self.rules.remove(id) {
            return Err(EngineError::RuleNotFound(id));
        }
        info!(rule_id = %id, "Rule removed");
        let mut event = AuditEvent::new(AuditEventType::RuleRemoved, "rule removed");
        event.rule_id = Some(id.to_string());
        self.record(event).await;
        Ok(())
    }

    /// Replaces the rule with `id` in place. The spec is validated first; an
    /// invalid spec leaves the stored rule untouched.
    pub async fn replace_rule(&self, id: RuleId, spec: RuleSpec) -> EngineResult<Rule> {
        let rule = spec.validate_with_id(id, &self.snapshot().impact)?;
        if !self.rules.replace(id, rule.clone()) {
            return Err(EngineError::RuleNotFound(id));
        }
        info!(rule_id = %id, check_name = %rule.check_name, "Rule replaced");
        self.record(
            AuditEvent::new(AuditEventType::RuleReplaced, "rule replaced")
                .with_rule(id, &rule.check_name),
        )
        .await;
        Ok(rule)
    }

    pub fn rules(&self) -> Arc<Vec<Rule>> {
        self.rules.list()
    }

    pub fn get_rule(&self, id: RuleId) -> Option<Rule> {
        self.rules.get(id)
    }

    /// Fire/no-fire for every rule without dispatching anything.
    pub fn preview_all(&self) -> Vec<Evaluation> {
        let snapshot = self.snapshot();
        self.rules
            .list()
            .iter()
            .map(|rule| TriggerEvaluator::evaluate(rule, &snapshot.outcomes))
            .collect()
    }

    pub async fn evaluate_one(&self, id: RuleId) -> EngineResult<TriggerResult> {
        let rule = self.rules.get(id).ok_or(EngineError::RuleNotFound(id))?;
        let snapshot = self.snapshot();
        Ok(self.run_rule(&rule, &snapshot).await)
    }

    /// Evaluates and dispatches every rule. Results come back in store
    /// order; dispatch across rules runs with bounded concurrency.
    pub async fn evaluate_all(&self) -> Vec<TriggerResult> {
        let rules = self.rules.list();
        let snapshot = self.snapshot();
        debug!(
            rules = rules.len(),
            snapshot_version = snapshot.version,
            "Evaluating all rules"
        );

        let snapshot = &snapshot;
        let futures: Vec<_> = rules
            .iter()
            .map(|rule| self.run_rule(rule, snapshot))
            .collect();
        stream::iter(futures)
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn run_rule(&self, rule: &Rule, snapshot: &Snapshot) -> TriggerResult {
        let evaluation = TriggerEvaluator::evaluate(rule, &snapshot.outcomes);
        METRICS.record_evaluation(evaluation.fired, evaluation.is_missing_check());
        if evaluation.is_missing_check() {
            warn!(rule_id = %rule.id, check_name = %rule.check_name, "{}", evaluation.message);
        }
        if evaluation.fired {
            METRICS.record_rule_fired(&rule.id.to_string());
        }

        let result = self
            .dispatcher
            .dispatch(rule, evaluation, &snapshot.impact)
            .await;
        if result.fired {
            self.audit_result(rule, &result).await;
        }
        result
    }

    async fn audit_result(&self, rule: &Rule, result: &TriggerResult) {
        if self.audit.is_none() {
            return;
        }

        let mut events = vec![AuditEventType::RuleFired];
        match result.alert_status {
            AlertStatus::Sent => events.push(AuditEventType::AlertSent),
            AlertStatus::Failed => events.push(AuditEventType::AlertFailed),
            AlertStatus::Skipped => {}
        }
        match result.termination_status {
            TerminationStatus::Succeeded => events.push(AuditEventType::WorkflowTerminated),
            TerminationStatus::NotFound => events.push(AuditEventType::WorkflowNotFound),
            TerminationStatus::Failed => events.push(AuditEventType::TerminationFailed),
            TerminationStatus::NotApplicable => {}
        }

        for event_type in events {
            let mut event = AuditEvent::new(event_type, result.message.clone())
                .with_rule(rule.id, &rule.check_name);
            if let Some(workflow) = rule.workflow_name() {
                event = event.with_workflow(workflow);
            }
            self.record(event).await;
        }
    }

    async fn record(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log(event).await {
                warn!(error = %e, "Failed to write audit event");
            }
        }
    }

    /// Seeds the store from configured specs. Invalid specs are reported
    /// together; valid ones are still added.
    pub async fn seed_rules(&self, specs: Vec<RuleSpec>) -> (Vec<RuleId>, Vec<(String, EngineError)>) {
        let mut added = Vec::new();
        let mut rejected = Vec::new();

        for spec in specs {
            let check_name = spec.check_name.clone();
            match self.add_rule(spec).await {
                Ok(id) => added.push(id),
                Err(e) => {
                    warn!(check_name = %check_name, error = %e, "Seed rule rejected");
                    rejected.push((check_name, e));
                }
            }
        }
        (added, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Alert, AlertSink, TerminationResponse, WorkflowTerminator};
    use crate::error::{TransportError, ValidationError};
    use crate::lineage::{LineageEdge, LineageNode, NodeKind};
    use crate::outcome::{CheckOutcome, Outcome};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl AlertSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(&self, _target: &str, _alert: &Alert) -> Result<(), TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Gone;

    #[async_trait]
    impl WorkflowTerminator for Gone {
        fn name(&self) -> &str {
            "gone"
        }

        async fn terminate(&self, _workflow: &str) -> Result<TerminationResponse, TransportError> {
            Ok(TerminationResponse { status: 404, body: "not found".into() })
        }
    }

    struct StaticOutcomes(Result<Vec<CheckOutcome>, FetchError>);

    #[async_trait]
    impl OutcomeSource for StaticOutcomes {
        fn name(&self) -> &str {
            "static"
        }

        async fn fetch(&self) -> Result<OutcomeBatch, FetchError> {
            self.0.clone().map(OutcomeBatch::raw)
        }
    }

    fn graph() -> LineageGraph {
        LineageGraph::new(
            vec![
                LineageNode::new("j", NodeKind::Job, "a.b.ingest_wf"),
                LineageNode::new("t", NodeKind::Table, "c.c.s.orders"),
            ],
            vec![LineageEdge::new("j", "t")],
        )
    }

    fn rows(outcome: Outcome) -> Vec<CheckOutcome> {
        vec![CheckOutcome::new("row_count_check", "orders", outcome, Utc::now())]
    }

    fn engine() -> (IncidentEngine, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let dispatcher = ActionDispatcher::new(sink.clone()).with_terminator(Arc::new(Gone));
        (IncidentEngine::new(dispatcher), sink)
    }

    #[tokio::test]
    async fn test_unknown_workflow_rejected_once_lineage_loaded() {
        let (engine, _) = engine();
        engine.load_snapshot(OutcomeBatch::raw(rows(Outcome::Fail)), Some(&graph()));

        let err = engine
            .add_rule(RuleSpec::alert_and_terminate("row_count_check", Outcome::Fail, "other_wf"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.rules().is_empty());
    }

    #[tokio::test]
    async fn test_lineage_without_downstream_workflows_blocks_termination() {
        let (engine, _) = engine();
        let tables_only = LineageGraph::new(
            vec![
                LineageNode::new("t1", NodeKind::Table, "c.c.s.orders"),
                LineageNode::new("t2", NodeKind::Table, "c.c.s.payroll"),
            ],
            vec![LineageEdge::new("t1", "t2")],
        );
        let spec = RuleSpec::alert_and_terminate("row_count_check", Outcome::Fail, "payroll_prod_wf");

        engine.load_snapshot(OutcomeBatch::raw(rows(Outcome::Fail)), Some(&tables_only));
        assert!(engine.snapshot().impact.is_loaded());
        let err = engine.add_rule(spec.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::UnknownWorkflow(ref wf)) if wf == "payroll_prod_wf"
        ));

        // Accepted while no lineage is known, refused again at trigger time.
        engine.load_snapshot(OutcomeBatch::raw(rows(Outcome::Fail)), None);
        let id = engine.add_rule(spec).await.unwrap();
        engine.load_snapshot(OutcomeBatch::raw(rows(Outcome::Fail)), Some(&tables_only));

        let result = engine.evaluate_one(id).await.unwrap();
        assert!(result.fired);
        assert_eq!(result.termination_status, TerminationStatus::Failed);
        assert!(result.message.contains("no longer downstream"));
    }

    #[tokio::test]
    async fn test_not_found_termination_is_reported() {
        let (engine, sink) = engine();
        engine.load_snapshot(OutcomeBatch::raw(rows(Outcome::Fail)), Some(&graph()));
        let id = engine
            .add_rule(
                RuleSpec::alert_and_terminate("row_count_check", Outcome::Fail, "ingest_wf")
                    .with_webhook("https://hooks.example/x"),
            )
            .await
            .unwrap();

        let result = engine.evaluate_one(id).await.unwrap();
        assert!(result.fired);
        assert_eq!(result.alert_status, AlertStatus::Sent);
        assert_eq!(result.termination_status, TerminationStatus::NotFound);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preview_fires_without_dispatching() {
        let (engine, sink) = engine();
        engine.load_snapshot(OutcomeBatch::raw(rows(Outcome::Fail)), Some(&graph()));
        engine
            .add_rule(
                RuleSpec::alert_and_terminate("row_count_check", Outcome::Fail, "ingest_wf")
                    .with_webhook("https://hooks.example/x"),
            )
            .await
            .unwrap();
        engine
            .add_rule(RuleSpec::alert_only("row_count_check", Outcome::Pass))
            .await
            .unwrap();

        let preview = engine.preview_all();
        assert_eq!(preview.len(), 2);
        assert!(preview[0].fired);
        assert!(!preview[1].fired);
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evaluate_unknown_rule_is_error() {
        let (engine, _) = engine();
        let err = engine.evaluate_one(RuleId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::RuleNotFound(_)));
        assert!(engine.remove_rule(RuleId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let (engine, _) = engine();
        let engine = engine.with_outcome_source(Arc::new(StaticOutcomes(Err(
            FetchError::Status { status: 503, body: "down".into() },
        ))));
        engine.load_snapshot(OutcomeBatch::raw(rows(Outcome::Pass)), None);

        let err = engine.refresh().await.unwrap_err();
        assert!(matches!(err, EngineError::Fetch(FetchError::Status { status: 503, .. })));
        assert_eq!(engine.snapshot().version, 1);
        assert!(engine.snapshot().outcomes.latest("row_count_check").is_some());
    }

    #[tokio::test]
    async fn test_refresh_without_outcome_source_is_config_error() {
        let (engine, _) = engine();
        assert!(matches!(engine.refresh().await, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_refresh_applies_table_filter() {
        let (engine, _) = engine();
        let mut fetched = rows(Outcome::Fail);
        fetched.push(CheckOutcome::new("freshness", "customers", Outcome::Pass, Utc::now()));
        let engine = engine
            .with_outcome_source(Arc::new(StaticOutcomes(Ok(fetched))))
            .with_table_filter("orders");

        let snapshot = engine.refresh().await.unwrap();
        assert_eq!(snapshot.outcomes.check_names(), vec!["row_count_check"]);
        assert!(snapshot.impact.is_empty());
    }

    #[tokio::test]
    async fn test_replace_keeps_position_and_id() {
        let (engine, _) = engine();
        let first = engine
            .add_rule(RuleSpec::alert_only("a", Outcome::Fail))
            .await
            .unwrap();
        let second = engine
            .add_rule(RuleSpec::alert_only("b", Outcome::Fail))
            .await
            .unwrap();

        let replaced = engine
            .replace_rule(first, RuleSpec::alert_only("a2", Outcome::Pass))
            .await
            .unwrap();
        assert_eq!(replaced.id, first);

        let rules = engine.rules();
        assert_eq!(rules[0].check_name, "a2");
        assert_eq!(rules[1].id, second);

        let invalid = engine
            .replace_rule(first, RuleSpec::alert_only("  ", Outcome::Pass))
            .await;
        assert!(invalid.is_err());
        assert_eq!(engine.rules()[0].check_name, "a2");
    }

    #[tokio::test]
    async fn test_fired_rules_are_audited() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine();
        let engine = engine.with_audit_log(AuditLog::open(dir.path()).unwrap());
        engine.load_snapshot(OutcomeBatch::raw(rows(Outcome::Fail)), Some(&graph()));
        let id = engine
            .add_rule(RuleSpec::alert_and_terminate("row_count_check", Outcome::Fail, "ingest_wf"))
            .await
            .unwrap();

        engine.evaluate_all().await;

        let audit = engine.audit_log().unwrap();
        let events = audit.query_by_rule_id(&id.to_string(), 10).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert!(types.contains(&AuditEventType::RuleCreated));
        assert!(types.contains(&AuditEventType::RuleFired));
        assert!(types.contains(&AuditEventType::WorkflowNotFound));
    }

    #[tokio::test]
    async fn test_seed_rules_reports_rejections() {
        let (engine, _) = engine();
        let (added, rejected) = engine
            .seed_rules(vec![
                RuleSpec::alert_only("a", Outcome::Fail),
                RuleSpec::alert_only("", Outcome::Fail),
            ])
            .await;
        assert_eq!(added.len(), 1);
        assert_eq!(rejected.len(), 1);
    }
}
