//! Lineage graph parsing and downstream impact indexing.
//!
//! A lineage response lists nodes (jobs, tables, ...) and directed
//! downstream edges. An edge from a job to a table means the job's workflow
//! writes that table, so terminating the workflow stops the table from
//! being refreshed with bad upstream data.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Raw lineage node type for workflow jobs.
const JOB_NODE_TYPE: &str = "dataosJob";
/// Raw lineage node type for tables.
const TABLE_NODE_TYPE: &str = "table";
/// Position of the workflow name in a job's qualified name.
const WORKFLOW_SEGMENT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    Job,
    Table,
    Other,
}

impl NodeKind {
    pub fn from_type(raw: &str) -> Self {
        match raw {
            JOB_NODE_TYPE => NodeKind::Job,
            TABLE_NODE_TYPE => NodeKind::Table,
            _ => NodeKind::Other,
        }
    }
}

impl<'de> Deserialize<'de> for NodeKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(NodeKind::from_type(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageNode {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(rename = "fullyQualifiedName", default)]
    pub qualified_name: String,
}

impl LineageNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, qualified_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            qualified_name: qualified_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageEdge {
    #[serde(rename = "fromEntity", deserialize_with = "string_or_number")]
    pub from: String,
    #[serde(rename = "toEntity", deserialize_with = "string_or_number")]
    pub to: String,
}

impl LineageEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Node/edge graph as returned by the lineage service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LineageGraph {
    pub nodes: Vec<LineageNode>,
    #[serde(rename = "downstreamEdges")]
    pub edges: Vec<LineageEdge>,
}

impl LineageGraph {
    pub fn new(nodes: Vec<LineageNode>, edges: Vec<LineageEdge>) -> Self {
        Self { nodes, edges }
    }

    /// Reads a lineage response leniently: nodes and edges that do not have
    /// the expected shape are dropped, and a body without `nodes` or
    /// `downstreamEdges` yields an empty graph.
    pub fn from_value(value: &Value) -> Self {
        let nodes = decode_items::<LineageNode>(value, "nodes");
        let edges = decode_items::<LineageEdge>(value, "downstreamEdges");
        Self { nodes, edges }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

fn decode_items<T: serde::de::DeserializeOwned>(value: &Value, key: &str) -> Vec<T> {
    let Some(items) = value.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut decoded = Vec::with_capacity(items.len());
    let mut dropped = 0usize;
    for item in items {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(v) => decoded.push(v),
            Err(_) => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!(field = key, dropped, "Dropped malformed lineage entries");
    }
    decoded
}

/// A single workflow → dataset pair of the impact index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ImpactPair {
    pub workflow: String,
    pub dataset: String,
}

/// Workflow name → datasets that workflow writes downstream.
///
/// `Default` is the index of a snapshot with no lineage. An index built by
/// [`LineageGraphParser::parse`] is loaded even when it has no workflows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImpactIndex {
    workflows: HashMap<String, BTreeSet<String>>,
    #[serde(skip)]
    loaded: bool,
}

impl ImpactIndex {
    /// True once built from a fetched lineage graph.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether a terminating rule may target `workflow`. Without lineage
    /// nothing can be checked; with lineage the workflow must be downstream.
    pub fn permits_termination(&self, workflow: &str) -> bool {
        !self.loaded || self.contains_workflow(workflow)
    }

    pub fn contains_workflow(&self, workflow: &str) -> bool {
        self.workflows.contains_key(workflow)
    }

    pub fn datasets(&self, workflow: &str) -> Option<&BTreeSet<String>> {
        self.workflows.get(workflow)
    }

    /// Workflow names sorted alphabetically.
    pub fn workflows(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Pairs whose workflow or dataset contains `query`, case-insensitively.
    /// An empty query matches everything.
    pub fn search(&self, query: &str) -> Vec<ImpactPair> {
        let needle = query.trim().to_lowercase();
        let mut pairs: Vec<ImpactPair> = self
            .workflows
            .iter()
            .flat_map(|(workflow, datasets)| {
                datasets.iter().map(move |dataset| ImpactPair {
                    workflow: workflow.clone(),
                    dataset: dataset.clone(),
                })
            })
            .filter(|pair| {
                needle.is_empty()
                    || pair.workflow.to_lowercase().contains(&needle)
                    || pair.dataset.to_lowercase().contains(&needle)
            })
            .collect();
        pairs.sort();
        pairs
    }

    pub fn pair_count(&self) -> usize {
        self.workflows.values().map(BTreeSet::len).sum()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    fn insert(&mut self, workflow: &str, dataset: &str) {
        self.workflows
            .entry(workflow.to_string())
            .or_default()
            .insert(dataset.to_string());
    }
}

/// Extracts the workflow name from a job's qualified name.
pub fn workflow_name(qualified_name: &str) -> Option<&str> {
    qualified_name
        .split('.')
        .nth(WORKFLOW_SEGMENT)
        .filter(|segment| !segment.is_empty())
}

pub struct LineageGraphParser;

impl LineageGraphParser {
    /// Builds the downstream impact index. Edges with an unresolved endpoint,
    /// a non-job source, a non-table target or a malformed job name are
    /// skipped; none of these are errors.
    pub fn parse(graph: &LineageGraph) -> ImpactIndex {
        let lookup: HashMap<&str, &LineageNode> = graph
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), node))
            .collect();

        let mut index = ImpactIndex {
            loaded: true,
            ..ImpactIndex::default()
        };
        let mut skipped = 0usize;

        for edge in &graph.edges {
            let (Some(from), Some(to)) = (lookup.get(edge.from.as_str()), lookup.get(edge.to.as_str()))
            else {
                skipped += 1;
                continue;
            };

            let workflow = match from.kind {
                NodeKind::Job => workflow_name(&from.qualified_name),
                _ => None,
            };
            let dataset = match to.kind {
                NodeKind::Table if !to.qualified_name.is_empty() => Some(to.qualified_name.as_str()),
                _ => None,
            };

            match (workflow, dataset) {
                (Some(workflow), Some(dataset)) => index.insert(workflow, dataset),
                _ => skipped += 1,
            }
        }

        debug!(
            workflows = index.len(),
            pairs = index.pair_count(),
            skipped_edges = skipped,
            "Parsed lineage graph"
        );
        index
    }
}
