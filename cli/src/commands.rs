use anyhow::{Context, Result};
use dq_guard_agents::{HttpWorkflowTerminator, LoggerAlertSink, WebhookAlertSink};
use dq_guard_connectors::{outcome_source, HttpLineageSource};
use dq_guard_core::agent::AlertSink;
use dq_guard_core::config::{AlertSinkKind, DqGuardConfig};
use dq_guard_core::dispatcher::{AlertStatus, TerminationStatus, TriggerResult};
use dq_guard_core::lineage::{ImpactIndex, LineageGraphParser};
use dq_guard_core::observability::AuditLog;
use dq_guard_core::source::LineageSource;
use dq_guard_core::{dispatcher::ActionDispatcher, IncidentEngine};
use std::sync::Arc;
use tracing::{info, warn};

/// Wires sources, sinks and the audit log from config. Rules are seeded
/// separately, after the first refresh, so workflows can be checked
/// against lineage.
pub fn build_engine(config: &DqGuardConfig) -> Result<IncidentEngine> {
    let token = config.auth.resolved_token();
    let timeout = config.engine.request_timeout();

    let sink: Arc<dyn AlertSink> = match config.alerts.sink {
        AlertSinkKind::Webhook => Arc::new(WebhookAlertSink::new(
            config.alerts.template.clone(),
            timeout,
        )?),
        AlertSinkKind::Logger => Arc::new(LoggerAlertSink),
    };

    let mut dispatcher = ActionDispatcher::new(sink)
        .with_timeout(timeout)
        .with_workflow_revalidation(config.engine.revalidate_workflows);
    if let Some(termination) = &config.termination {
        dispatcher = dispatcher.with_terminator(Arc::new(HttpWorkflowTerminator::new(
            &termination.base_url,
            termination.workspace.clone(),
            token.clone(),
            timeout,
        )?));
    }

    let mut engine = IncidentEngine::new(dispatcher)
        .with_concurrency(config.engine.dispatch_concurrency)
        .with_outcome_source(outcome_source(&config.outcomes, token.clone(), timeout)?);

    if let Some(lineage) = &config.lineage {
        engine = engine.with_lineage_source(Arc::new(HttpLineageSource::from_config(
            lineage, token, timeout,
        )?));
    }
    if let Some(table) = config.outcomes.table_filter() {
        engine = engine.with_table_filter(table);
    }
    if let Some(path) = &config.engine.audit_path {
        let audit = AuditLog::open(path)
            .with_context(|| format!("failed to open audit log at {}", path.display()))?;
        engine = engine.with_audit_log(audit);
    }

    Ok(engine)
}

pub async fn seed_rules(engine: &IncidentEngine, config: &DqGuardConfig) {
    let (added, rejected) = engine.seed_rules(config.rules.clone()).await;
    for (check_name, err) in &rejected {
        eprintln!("❌ Rule for check '{}' rejected: {}", check_name, err);
    }
    info!(added = added.len(), rejected = rejected.len(), "Seed rules loaded");
}

/// Refresh once, evaluate all seeded rules, print the results. Only a
/// failed refresh is an error.
pub async fn evaluate(config: &DqGuardConfig, json: bool) -> Result<()> {
    let engine = build_engine(config)?;

    let snapshot = engine.refresh().await.context("refresh failed")?;
    seed_rules(&engine, config).await;
    if engine.rules().is_empty() {
        warn!("No rules configured");
    }

    let results = engine.evaluate_all().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    println!(
        "Snapshot v{}: {} checks, {} downstream workflows\n",
        snapshot.version,
        snapshot.outcomes.len(),
        snapshot.impact.len()
    );
    for result in &results {
        print_result(result);
    }
    let fired = results.iter().filter(|r| r.fired).count();
    println!("\n{} of {} rule(s) fired", fired, results.len());
    Ok(())
}

/// Like [`evaluate`], but only reports which rules would fire.
pub async fn preview(config: &DqGuardConfig, json: bool) -> Result<()> {
    let engine = build_engine(config)?;
    engine.refresh().await.context("refresh failed")?;
    seed_rules(&engine, config).await;

    let evaluations = engine.preview_all();
    if json {
        println!("{}", serde_json::to_string_pretty(&evaluations)?);
        return Ok(());
    }
    for evaluation in &evaluations {
        let marker = if evaluation.fired { "🔥" } else { "·" };
        println!("{} {} {}", marker, evaluation.check_name, evaluation.message);
    }
    let fired = evaluations.iter().filter(|e| e.fired).count();
    println!("\n{} of {} rule(s) would fire (dry run)", fired, evaluations.len());
    Ok(())
}

fn print_result(result: &TriggerResult) {
    let marker = if !result.fired {
        "·"
    } else if result.alert_status == AlertStatus::Failed
        || result.termination_status == TerminationStatus::Failed
    {
        "❌"
    } else {
        "🔥"
    };
    println!(
        "{} {} [alert: {:?}, termination: {:?}] {}",
        marker, result.check_name, result.alert_status, result.termination_status, result.message
    );
}

async fn fetch_impact(config: &DqGuardConfig) -> Result<ImpactIndex> {
    let lineage = config
        .lineage
        .as_ref()
        .context("no lineage section configured")?;
    let source = HttpLineageSource::from_config(
        lineage,
        config.auth.resolved_token(),
        config.engine.request_timeout(),
    )?;
    let graph = source.fetch().await?;
    Ok(LineageGraphParser::parse(&graph))
}

pub async fn lineage(config: &DqGuardConfig, search: Option<&str>) -> Result<()> {
    let impact = fetch_impact(config).await?;

    let pairs = impact.search(search.unwrap_or_default());
    if pairs.is_empty() {
        println!("No downstream impact found");
        return Ok(());
    }
    for pair in &pairs {
        println!("{} -> {}", pair.workflow, pair.dataset);
    }
    println!(
        "\n{} pair(s) across {} workflow(s)",
        pairs.len(),
        impact.len()
    );
    Ok(())
}

/// Validates seeded rules without dispatching anything. Workflows are
/// checked against lineage when it can be fetched.
pub async fn validate(config: &DqGuardConfig) -> Result<()> {
    let impact = if config.lineage.is_some() {
        match fetch_impact(config).await {
            Ok(impact) => impact,
            Err(e) => {
                warn!(error = %e, "Lineage unavailable, skipping workflow checks");
                ImpactIndex::default()
            }
        }
    } else {
        ImpactIndex::default()
    };

    let mut invalid = 0;
    for spec in &config.rules {
        let check_name = spec.check_name.clone();
        match spec.clone().validate(&impact) {
            Ok(rule) => println!("✅ Rule for '{}' ({:?}): Valid", check_name, rule.action_kind()),
            Err(e) => {
                eprintln!("❌ Rule for '{}': Invalid - {}", check_name, e);
                invalid += 1;
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{} of {} rule(s) invalid", invalid, config.rules.len());
    }
    println!("\n✅ All {} rule(s) valid", config.rules.len());
    Ok(())
}
