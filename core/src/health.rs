//! Aggregate health figures over raw outcome rows. Pure data; rendering is
//! up to the caller.

use crate::outcome::{CheckOutcome, Outcome};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub datasets_monitored: usize,
    pub total_checks: usize,
    pub passed: usize,
    pub failed: usize,
    /// Percentage of passing rows, 0-100. Zero when there are no rows.
    pub pass_rate: f64,
}

/// Figures for one table. Tables with the same name in different schemas
/// are kept apart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableHealth {
    pub schema_name: Option<String>,
    pub table_name: String,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    /// Passing share of this table's rows, 0-100.
    pub health_score: f64,
    pub last_scan: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub passed: usize,
    pub failed: usize,
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn dataset_key(row: &CheckOutcome) -> (Option<&str>, &str) {
    (row.schema_name.as_deref(), row.table_name.as_str())
}

pub fn summarize(rows: &[CheckOutcome]) -> HealthSummary {
    let datasets: BTreeSet<(Option<&str>, &str)> = rows.iter().map(dataset_key).collect();
    let passed = rows.iter().filter(|r| r.outcome == Outcome::Pass).count();
    let failed = rows.len() - passed;

    HealthSummary {
        datasets_monitored: datasets.len(),
        total_checks: rows.len(),
        passed,
        failed,
        pass_rate: percentage(passed, rows.len()),
    }
}

/// Per-table figures sorted by schema, then table name. Rows without a
/// schema sort first.
pub fn by_table(rows: &[CheckOutcome]) -> Vec<TableHealth> {
    let mut tables: BTreeMap<(Option<&str>, &str), (usize, usize, DateTime<Utc>)> = BTreeMap::new();

    for row in rows {
        let entry = tables
            .entry(dataset_key(row))
            .or_insert((0, 0, row.observed_at));
        match row.outcome {
            Outcome::Pass => entry.0 += 1,
            Outcome::Fail => entry.1 += 1,
        }
        if row.observed_at > entry.2 {
            entry.2 = row.observed_at;
        }
    }

    tables
        .into_iter()
        .map(|((schema_name, table_name), (passed, failed, last_scan))| {
            let total = passed + failed;
            TableHealth {
                schema_name: schema_name.map(str::to_string),
                table_name: table_name.to_string(),
                passed,
                failed,
                total,
                health_score: percentage(passed, total),
                last_scan,
            }
        })
        .collect()
}

/// Pass/fail counts per UTC day for one table, oldest first.
pub fn daily_counts(rows: &[CheckOutcome], table_name: &str) -> Vec<DailyCount> {
    let mut days: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();

    for row in rows.iter().filter(|r| r.table_name == table_name) {
        let day = days.entry(row.observed_at.date_naive()).or_default();
        match row.outcome {
            Outcome::Pass => day.0 += 1,
            Outcome::Fail => day.1 += 1,
        }
    }

    days.into_iter()
        .map(|(date, (passed, failed))| DailyCount {
            date,
            passed,
            failed,
        })
        .collect()
}

fn split_labels(labels: Option<&str>) -> impl Iterator<Item = &str> {
    labels
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
}

/// Keeps rows carrying at least one of `selected`. An empty selection keeps
/// everything.
pub fn filter_by_labels(rows: &[CheckOutcome], selected: &[String]) -> Vec<CheckOutcome> {
    if selected.is_empty() {
        return rows.to_vec();
    }
    rows.iter()
        .filter(|row| {
            split_labels(row.labels.as_deref()).any(|label| selected.iter().any(|s| s == label))
        })
        .cloned()
        .collect()
}

/// Distinct labels across all rows, sorted.
pub fn all_labels(rows: &[CheckOutcome]) -> Vec<String> {
    let labels: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| split_labels(row.labels.as_deref()))
        .collect();
    labels.into_iter().map(str::to_string).collect()
}
