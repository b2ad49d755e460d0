//! Error taxonomy for the incident engine.
//!
//! Only fetches and rule validation surface as `Err` to callers. Missing
//! checks, already-deleted workflows and failed alert/termination calls are
//! recorded as states on a [`TriggerResult`](crate::dispatcher::TriggerResult).

use crate::rule::RuleId;
use std::time::Duration;
use thiserror::Error;

/// A lineage or outcome fetch failed. The previous snapshot stays in place.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The source could not be reached at the network layer.
    #[error("source unreachable: {0}")]
    Unreachable(String),

    /// The source answered with a non-2xx status.
    #[error("source returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The fetch did not complete within the configured timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// A rule was rejected before it reached the rule store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("check name must not be empty")]
    EmptyCheckName,

    #[error("alert-and-terminate rules require a workflow name")]
    MissingWorkflow,

    #[error("workflow '{0}' is not downstream in the current lineage snapshot")]
    UnknownWorkflow(String),
}

/// An alert or termination call failed. Never fatal; recorded per rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    /// The endpoint answered, but not with a 2xx status.
    #[error("endpoint returned status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by the public [`IncidentEngine`](crate::IncidentEngine) API.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("rule not found: {0}")]
    RuleNotFound(RuleId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("audit log error: {0}")]
    Audit(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
