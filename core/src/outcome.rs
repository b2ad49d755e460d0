//! Check outcomes and the latest-per-check index.
//!
//! The outcome store can hold many historical rows for one check. The index
//! keeps exactly one live row per `check_name`: the one with the greatest
//! `observed_at`, and on equal timestamps the one that arrived last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Pass/Fail result of a single check execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Outcome {
    Pass,
    Fail,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" | "passed" => Ok(Outcome::Pass),
            "fail" | "failed" => Ok(Outcome::Fail),
            other => Err(format!("unknown check outcome '{}'", other)),
        }
    }
}

impl TryFrom<String> for Outcome {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One row from the outcome source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check_name: String,
    pub table_name: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub definition: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    /// Comma-separated dataset labels, when the source joins them in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
}

impl CheckOutcome {
    pub fn new(
        check_name: impl Into<String>,
        table_name: impl Into<String>,
        outcome: Outcome,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            table_name: table_name.into(),
            outcome,
            definition: String::new(),
            observed_at,
            schema_name: None,
            labels: None,
        }
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = definition.into();
        self
    }

    pub fn with_schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn with_labels(mut self, labels: impl Into<String>) -> Self {
        self.labels = Some(labels.into());
        self
    }
}

/// Latest outcome per check name. Rebuilt wholesale on every fetch.
#[derive(Debug, Clone, Default)]
pub struct CheckOutcomeIndex {
    latest: HashMap<String, CheckOutcome>,
    superseded: usize,
}

impl CheckOutcomeIndex {
    /// Builds the index from rows in arrival order.
    pub fn build<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = CheckOutcome>,
    {
        let mut latest: HashMap<String, CheckOutcome> = HashMap::new();
        let mut superseded = 0;

        for row in rows {
            match latest.entry(row.check_name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(row);
                }
                Entry::Occupied(mut slot) => {
                    superseded += 1;
                    // `>=` so that a later arrival wins a timestamp tie.
                    if row.observed_at >= slot.get().observed_at {
                        slot.insert(row);
                    }
                }
            }
        }

        debug!(
            checks = latest.len(),
            superseded_rows = superseded,
            "Built check outcome index"
        );

        Self { latest, superseded }
    }

    pub fn latest(&self, check_name: &str) -> Option<&CheckOutcome> {
        self.latest.get(check_name)
    }

    /// Check names sorted alphabetically, for check pickers.
    pub fn check_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.latest.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Latest outcomes sorted by check name.
    pub fn outcomes(&self) -> Vec<&CheckOutcome> {
        let mut rows: Vec<&CheckOutcome> = self.latest.values().collect();
        rows.sort_by(|a, b| a.check_name.cmp(&b.check_name));
        rows
    }

    /// Number of input rows that were not the live row for their check.
    pub fn superseded_rows(&self) -> usize {
        self.superseded
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
