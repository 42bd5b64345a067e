//! Declarative workflow definitions.
//!
//! A workflow is either an explicit node/edge graph or a legacy ordered list
//! of steps (each implicitly depending on the previous one). Definitions are
//! parsed from TOML (`[workflow]` table) or JSON.
//!
//! # Example TOML
//!
//! ```toml
//! [workflow]
//! id = "nightly_report"
//! name = "Nightly report"
//! status = "active"
//!
//! [[workflow.nodes]]
//! id = "fetch"
//! type = "http"
//! data = { url = "https://example.com/report.json" }
//!
//! [[workflow.nodes]]
//! id = "notify"
//! type = "shell"
//! data = { command = "echo ${fetch.status}", continue_on_failure = true }
//!
//! [[workflow.edges]]
//! source = "fetch"
//! target = "notify"
//!
//! [[workflow.triggers]]
//! type = "cron"
//! expression = "0 2 * * *"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::graph::ExecutionGraph;

/// Node data keys interpreted by the engine rather than the runner.
pub const RESERVED_DATA_KEYS: &[&str] = &["continue_on_failure"];

/// Longest workflow or node id accepted, in characters.
///
/// Ids are embedded verbatim into generated modules, so they must fit the
/// embedding limit untouched.
pub const MAX_ID_LEN: usize = 256;

/// Reject ids that are too long to embed unchanged.
pub(crate) fn check_id_len(kind: &str, id: &str) -> std::result::Result<(), String> {
    let len = id.chars().count();
    if len > MAX_ID_LEN {
        let head: String = id.chars().take(32).collect();
        return Err(format!(
            "{kind} id '{head}...' is {len} characters; the limit is {MAX_ID_LEN}"
        ));
    }
    Ok(())
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

/// One step in the explicit graph form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique node id within the workflow.
    pub id: String,

    /// Step type tag selecting the runner.
    #[serde(rename = "type")]
    pub step_type: String,

    /// Runner parameters plus the reserved engine keys.
    #[serde(default)]
    pub data: Value,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            data,
        }
    }

    /// Per-node failure policy override.
    pub fn continue_on_failure(&self) -> Option<bool> {
        self.data.get("continue_on_failure").and_then(Value::as_bool)
    }

    /// Per-node timeout override.
    pub fn timeout(&self) -> Option<Duration> {
        self.data
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
    }

    /// Runner parameters: `data` without the engine's reserved keys.
    pub fn params(&self) -> Value {
        match &self.data {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !RESERVED_DATA_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        }
    }
}

/// A dependency: `source` must finish before `target` starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub source: String,
    pub target: String,
}

impl EdgeDefinition {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Legacy linear step. Each step depends on the one before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,

    #[serde(rename = "type")]
    pub step_type: String,

    #[serde(default)]
    pub data: Value,
}

/// How a composite trigger combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    And,
    Or,
}

/// An external condition that starts a new execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDefinition {
    /// Time based, standard five-field cron expression.
    Cron { expression: String },

    /// Fires when a matching file is created under `path`.
    FileWatch {
        path: PathBuf,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        recursive: bool,
    },

    /// Combines sub-triggers.
    Composite {
        mode: CompositeMode,
        triggers: Vec<TriggerDefinition>,
    },
}

/// Top-level wrapper matching the TOML structure `[workflow]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowFile {
    pub workflow: Workflow,
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub status: WorkflowStatus,

    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,

    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,

    /// Legacy linear form; mutually exclusive with `nodes`.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,

    /// Base time for cron evaluation.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Resolve either graph form into nodes and edges.
///
/// Legacy steps become nodes chained `step[i-1] -> step[i]`.
pub fn resolve_graph(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
    steps: &[StepDefinition],
) -> (Vec<NodeDefinition>, Vec<EdgeDefinition>) {
    if !nodes.is_empty() {
        return (nodes.to_vec(), edges.to_vec());
    }
    let nodes: Vec<NodeDefinition> = steps
        .iter()
        .map(|s| NodeDefinition::new(s.id.clone(), s.step_type.clone(), s.data.clone()))
        .collect();
    let edges = steps
        .windows(2)
        .map(|pair| EdgeDefinition::new(pair[0].id.clone(), pair[1].id.clone()))
        .collect();
    (nodes, edges)
}

// ---------------------------------------------------------------------------
// Construction & parsing
// ---------------------------------------------------------------------------

impl Workflow {
    /// Create an empty draft workflow.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: WorkflowStatus::Draft,
            nodes: Vec::new(),
            edges: Vec::new(),
            steps: Vec::new(),
            triggers: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_node(mut self, id: &str, step_type: &str, data: Value) -> Self {
        self.nodes.push(NodeDefinition::new(id, step_type, data));
        self
    }

    pub fn with_edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(EdgeDefinition::new(source, target));
        self
    }

    pub fn with_step(mut self, id: &str, step_type: &str, data: Value) -> Self {
        self.steps.push(StepDefinition {
            id: id.to_string(),
            step_type: step_type.to_string(),
            data,
        });
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Parse a workflow from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::Validation(format!("JSON parse error: {e}")))
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Validation(format!("JSON serialize error: {e}")))
    }

    /// Load a workflow from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Validation(format!("Failed to read {}: {e}", path.display()))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => WorkflowFile::from_toml(&content).map(|f| f.workflow),
        }
    }

    /// Nodes of the effective graph.
    pub fn resolved_nodes(&self) -> Vec<NodeDefinition> {
        resolve_graph(&self.nodes, &self.edges, &self.steps).0
    }

    /// Edges of the effective graph.
    pub fn resolved_edges(&self) -> Vec<EdgeDefinition> {
        resolve_graph(&self.nodes, &self.edges, &self.steps).1
    }

    /// Look up a node of the effective graph.
    pub fn node(&self, id: &str) -> Option<NodeDefinition> {
        self.resolved_nodes().into_iter().find(|n| n.id == id)
    }

    /// Whether the workflow is eligible for trigger evaluation.
    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }
}

impl WorkflowFile {
    /// Parse a workflow definition from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| PipelineError::Validation(format!("TOML parse error: {e}")))
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Validation(format!("TOML serialize error: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Workflow {
    /// Validate the workflow definition.
    ///
    /// Checks:
    /// - Non-empty id and name
    /// - Exactly one graph form, with at least one node
    /// - Unique, non-empty node ids and non-empty step types
    /// - Ids no longer than [`MAX_ID_LEN`]
    /// - Edges reference known nodes
    /// - No cycles
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "Workflow id cannot be empty".into(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(PipelineError::Validation(
                "Workflow name cannot be empty".into(),
            ));
        }
        check_id_len("Workflow", &self.id).map_err(PipelineError::Validation)?;
        if !self.nodes.is_empty() && !self.steps.is_empty() {
            return Err(PipelineError::Validation(format!(
                "Workflow '{}' mixes nodes and legacy steps",
                self.id
            )));
        }
        if !self.steps.is_empty() && !self.edges.is_empty() {
            return Err(PipelineError::Validation(format!(
                "Workflow '{}' declares edges for legacy steps",
                self.id
            )));
        }

        let nodes = self.resolved_nodes();
        if nodes.is_empty() {
            return Err(PipelineError::Validation(format!(
                "Workflow '{}' must have at least one node",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for node in &nodes {
            if node.id.trim().is_empty() {
                return Err(PipelineError::Validation("Node id cannot be empty".into()));
            }
            check_id_len("Node", &node.id).map_err(PipelineError::Validation)?;
            if node.step_type.trim().is_empty() {
                return Err(PipelineError::Validation(format!(
                    "Node '{}' has no step type",
                    node.id
                )));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "Duplicate node id: {}",
                    node.id
                )));
            }
        }

        ExecutionGraph::build(self)?.topological_order()?;
        Ok(())
    }
}
