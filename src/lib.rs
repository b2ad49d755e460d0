//! # dq_guard
//!
//! Incident rule engine for data-quality check outcomes. This crate bundles
//! the engine with the stock alert sinks, the workflow terminator and the
//! lineage/outcome sources.
//!
//! ```no_run
//! use dq_guard::agents::{HttpWorkflowTerminator, WebhookAlertSink};
//! use dq_guard::connectors::FileOutcomeSource;
//! use dq_guard::dispatcher::ActionDispatcher;
//! use dq_guard::outcome::Outcome;
//! use dq_guard::rule::RuleSpec;
//! use dq_guard::IncidentEngine;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let timeout = Duration::from_secs(30);
//! let dispatcher = ActionDispatcher::new(Arc::new(WebhookAlertSink::new(None, timeout)?))
//!     .with_terminator(Arc::new(HttpWorkflowTerminator::new(
//!         "https://ctx.example",
//!         "public",
//!         None,
//!         timeout,
//!     )?));
//! let engine = IncidentEngine::new(dispatcher)
//!     .with_outcome_source(Arc::new(FileOutcomeSource::new("outcomes.json", false)));
//!
//! engine.refresh().await?;
//! engine
//!     .add_rule(RuleSpec::alert_only("row_count_check", Outcome::Fail).with_webhook("https://hooks.example/x"))
//!     .await?;
//! for result in engine.evaluate_all().await {
//!     println!("{} fired={}", result.check_name, result.fired);
//! }
//! # Ok(())
//! # }
//! ```

pub use dq_guard_core::*;

pub mod agents {
    pub use dq_guard_agents::*;
}

pub mod connectors {
    pub use dq_guard_connectors::*;
}
