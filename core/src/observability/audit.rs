//! Append-only audit trail of rule changes, refreshes and the actions
//! taken against alert and workflow endpoints.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RuleCreated,
    RuleRemoved,
    RuleReplaced,
    SnapshotRefreshed,
    RefreshFailed,
    RuleFired,
    AlertSent,
    AlertFailed,
    WorkflowTerminated,
    /// Termination found the workflow already gone.
    WorkflowNotFound,
    TerminationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub rule_id: Option<String>,
    pub check_name: Option<String>,
    pub workflow_name: Option<String>,
    pub metadata: serde_json::Value,
    pub description: String,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            rule_id: None,
            check_name: None,
            workflow_name: None,
            metadata: serde_json::Value::Null,
            description: description.into(),
        }
    }

    pub fn with_rule(mut self, rule_id: impl ToString, check_name: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.to_string());
        self.check_name = Some(check_name.into());
        self
    }

    pub fn with_workflow(mut self, workflow_name: impl Into<String>) -> Self {
        self.workflow_name = Some(workflow_name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Audit log storage in a dedicated sled tree.
pub struct AuditLog {
    db: Arc<Db>,
    tree_name: &'static str,
}

impl AuditLog {
    pub fn new(db: Arc<Db>) -> Result<Self> {
        Ok(Self {
            db,
            tree_name: "audit_log",
        })
    }

    /// Opens (or creates) a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub async fn log(&self, event: AuditEvent) -> Result<()> {
        let tree = self.db.open_tree(self.tree_name)?;

        // Zero-padded nanos keep keys in chronological byte order
        let key = format!("{}_{}", Self::key_prefix(event.timestamp), event.id);
        let value = serde_json::to_vec(&event)?;
        tree.insert(key.as_bytes(), value)?;

        debug!(
            event_id = %event.id,
            event_type = ?event.event_type,
            rule_id = ?event.rule_id,
            "Audit event logged"
        );

        Ok(())
    }

    /// Events in `[start, end)`, oldest first.
    pub async fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let tree = self.db.open_tree(self.tree_name)?;

        let start_key = format!("{}_", Self::key_prefix(start));
        let end_key = format!("{}_", Self::key_prefix(end));

        let mut events = Vec::new();
        for item in tree.range(start_key.as_bytes()..end_key.as_bytes()) {
            if events.len() >= limit {
                break;
            }
            match item {
                Ok((_key, value)) => match serde_json::from_slice::<AuditEvent>(&value) {
                    Ok(event) => events.push(event),
                    Err(e) => error!(error = %e, "Failed to deserialize audit event"),
                },
                Err(e) => error!(error = %e, "Failed to read audit event from storage"),
            }
        }

        Ok(events)
    }

    /// Most recent first.
    pub async fn query_by_rule_id(&self, rule_id: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        self.query_latest(limit, |event| event.rule_id.as_deref() == Some(rule_id))
    }

    /// Most recent first.
    pub async fn query_by_type(
        &self,
        event_type: AuditEventType,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        self.query_latest(limit, |event| event.event_type == event_type)
    }

    pub fn count(&self) -> Result<usize> {
        let tree = self.db.open_tree(self.tree_name)?;
        Ok(tree.len())
    }

    fn query_latest<F>(&self, limit: usize, matches: F) -> Result<Vec<AuditEvent>>
    where
        F: Fn(&AuditEvent) -> bool,
    {
        let tree = self.db.open_tree(self.tree_name)?;
        let mut events = Vec::new();

        for item in tree.iter().rev() {
            if events.len() >= limit {
                break;
            }
            if let Ok((_key, value)) = item {
                if let Ok(event) = serde_json::from_slice::<AuditEvent>(&value) {
                    if matches(&event) {
                        events.push(event);
                    }
                }
            }
        }

        Ok(events)
    }

    fn key_prefix(ts: DateTime<Utc>) -> String {
        format!("{:020}", ts.timestamp_nanos_opt().unwrap_or(0).max(0))
    }
}
