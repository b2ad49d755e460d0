//! Seams for the two upstream data sources. Implementations live in the
//! connectors crate.

use crate::error::FetchError;
use crate::lineage::LineageGraph;
use crate::outcome::CheckOutcome;
use async_trait::async_trait;

/// Rows returned by one outcome fetch.
#[derive(Debug, Clone, Default)]
pub struct OutcomeBatch {
    pub rows: Vec<CheckOutcome>,
    /// Whether the source already ranked rows to one latest row per check.
    pub ranked: bool,
}

impl OutcomeBatch {
    pub fn raw(rows: Vec<CheckOutcome>) -> Self {
        Self { rows, ranked: false }
    }

    pub fn ranked(rows: Vec<CheckOutcome>) -> Self {
        Self { rows, ranked: true }
    }
}

#[async_trait]
pub trait LineageSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> Result<LineageGraph, FetchError>;
}

#[async_trait]
pub trait OutcomeSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> Result<OutcomeBatch, FetchError>;
}
