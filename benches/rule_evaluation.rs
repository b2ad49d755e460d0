//! Benchmark suite for outcome indexing, lineage parsing and rule evaluation

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dq_guard::agent::{Alert, AlertSink};
use dq_guard::dispatcher::ActionDispatcher;
use dq_guard::error::TransportError;
use dq_guard::evaluator::TriggerEvaluator;
use dq_guard::lineage::{ImpactIndex, LineageEdge, LineageGraph, LineageGraphParser, LineageNode, NodeKind};
use dq_guard::outcome::{CheckOutcome, CheckOutcomeIndex, Outcome};
use dq_guard::rule::{Rule, RuleSpec};
use dq_guard::source::OutcomeBatch;
use dq_guard::IncidentEngine;
use std::sync::Arc;

struct NullSink;

#[async_trait]
impl AlertSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(&self, _target: &str, _alert: &Alert) -> Result<(), TransportError> {
        Ok(())
    }
}

/// `size` rows spread over `size / 10` checks, every tenth row failing.
fn create_rows(size: usize) -> Vec<CheckOutcome> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let checks = (size / 10).max(1);
    (0..size)
        .map(|i| {
            let outcome = if i % 10 == 0 { Outcome::Fail } else { Outcome::Pass };
            CheckOutcome::new(
                format!("check_{}", i % checks),
                "orders",
                outcome,
                base + Duration::seconds(i as i64),
            )
        })
        .collect()
}

/// One job per workflow, each writing `tables_per_job` tables.
fn create_graph(jobs: usize, tables_per_job: usize) -> LineageGraph {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for j in 0..jobs {
        let job_id = format!("job_{}", j);
        nodes.push(LineageNode::new(
            job_id.clone(),
            NodeKind::Job,
            format!("dataos.public.wf_{}.dag", j),
        ));
        for t in 0..tables_per_job {
            let table_id = format!("table_{}_{}", j, t);
            nodes.push(LineageNode::new(
                table_id.clone(),
                NodeKind::Table,
                format!("lake.retail.t_{}_{}", j, t),
            ));
            edges.push(LineageEdge::new(job_id.clone(), table_id));
        }
    }
    LineageGraph::new(nodes, edges)
}

fn create_rules(count: usize) -> Vec<Rule> {
    (0..count)
        .map(|i| {
            RuleSpec::alert_only(format!("check_{}", i), Outcome::Fail)
                .validate(&ImpactIndex::default())
                .unwrap()
        })
        .collect()
}

fn benchmark_index_build(c: &mut Criterion) {
    let rows = create_rows(10_000);

    c.bench_function("outcome_index_10k_rows", |b| {
        b.iter(|| black_box(CheckOutcomeIndex::build(rows.iter().cloned())))
    });
}

fn benchmark_lineage_parse(c: &mut Criterion) {
    let graph = create_graph(200, 10);

    c.bench_function("lineage_parse_200_jobs", |b| {
        b.iter(|| black_box(LineageGraphParser::parse(&graph)))
    });
}

fn benchmark_trigger_evaluation(c: &mut Criterion) {
    let index = CheckOutcomeIndex::build(create_rows(10_000));
    let rules = create_rules(1_000);

    c.bench_function("evaluate_1k_rules", |b| {
        b.iter(|| {
            for rule in &rules {
                black_box(TriggerEvaluator::evaluate(rule, &index));
            }
        })
    });
}

fn benchmark_evaluate_all(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = IncidentEngine::new(ActionDispatcher::new(Arc::new(NullSink))).with_concurrency(8);
    engine.load_snapshot(OutcomeBatch::raw(create_rows(1_000)), None);
    runtime.block_on(async {
        for i in 0..100 {
            engine
                .add_rule(
                    RuleSpec::alert_only(format!("check_{}", i), Outcome::Fail)
                        .with_webhook("https://hooks.example.com/dq"),
                )
                .await
                .unwrap();
        }
    });

    c.bench_function("evaluate_all_100_rules", |b| {
        b.to_async(&runtime).iter(|| async { black_box(engine.evaluate_all().await) })
    });
}

criterion_group!(
    benches,
    benchmark_index_build,
    benchmark_lineage_parse,
    benchmark_trigger_evaluation,
    benchmark_evaluate_all
);
criterion_main!(benches);
