use crate::lineage::ImpactIndex;
use crate::outcome::{CheckOutcome, CheckOutcomeIndex};
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};

/// Coherent point-in-time view of the last successful refresh.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Monotonic version; 0 means nothing has been loaded yet.
    pub version: u64,
    pub outcomes: CheckOutcomeIndex,
    pub impact: ImpactIndex,
    /// Raw rows behind `outcomes`, kept for health summaries.
    pub rows: Vec<CheckOutcome>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn is_loaded(&self) -> bool {
        self.version > 0
    }
}

/// Holds the current snapshot behind a pointer that is swapped whole on
/// refresh. Evaluations clone the `Arc` and never observe a half-built
/// snapshot.
#[derive(Debug, Default)]
pub struct SnapshotState {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Publishes a new snapshot and returns its version.
    pub fn publish(
        &self,
        outcomes: CheckOutcomeIndex,
        impact: ImpactIndex,
        rows: Vec<CheckOutcome>,
    ) -> Arc<Snapshot> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(Snapshot {
            version: guard.version + 1,
            outcomes,
            impact,
            rows,
            refreshed_at: Some(Utc::now()),
        });
        *guard = Arc::clone(&next);
        next
    }
}
