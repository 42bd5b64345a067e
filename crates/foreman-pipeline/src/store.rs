//! Workflow and execution persistence.
//!
//! The engine talks to storage only through [`WorkflowStore`]. The bundled
//! [`MemoryStore`] keeps everything in process and is what the CLI and the
//! tests use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::definition::Workflow;
use crate::error::{PipelineError, Result};

/// Lifecycle of one execution.
///
/// ```text
/// pending ──► running ──► completed
///    │           │
///    └───────────┴──────► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether moving to `next` is allowed. Transitions only move forward.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        })
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Per-step outcomes and aggregate metadata, set when the run ends.
    pub result: Option<Value>,
}

/// Storage for workflow definitions and execution records.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow(&self, id: &str) -> Result<Workflow>;

    /// Insert or replace a workflow definition.
    async fn put_workflow(&self, workflow: Workflow) -> Result<()>;

    /// Remove a workflow. Returns whether it existed.
    async fn remove_workflow(&self, id: &str) -> Result<bool>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>>;

    /// Create a pending execution for an existing workflow.
    async fn create_execution(&self, workflow_id: &str) -> Result<Execution>;

    /// Move an execution to `status`, rejecting backward transitions.
    async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<String>,
        result: Option<Value>,
    ) -> Result<Execution>;

    async fn get_execution(&self, id: &str) -> Result<Execution>;
}

/// In-memory [`WorkflowStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<String, Workflow>>,
    executions: RwLock<HashMap<String, Execution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executions of one workflow, oldest first.
    pub fn executions_for(&self, workflow_id: &str) -> Vec<Execution> {
        let mut list: Vec<Execution> = self
            .executions
            .read()
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        list.sort_by_key(|e| e.created_at);
        list
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn get_workflow(&self, id: &str) -> Result<Workflow> {
        self.workflows
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::WorkflowNotFound(id.to_string()))
    }

    async fn put_workflow(&self, workflow: Workflow) -> Result<()> {
        debug!(workflow_id = %workflow.id, "Storing workflow");
        self.workflows.write().insert(workflow.id.clone(), workflow);
        Ok(())
    }

    async fn remove_workflow(&self, id: &str) -> Result<bool> {
        Ok(self.workflows.write().remove(id).is_some())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let mut list: Vec<Workflow> = self.workflows.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn create_execution(&self, workflow_id: &str) -> Result<Execution> {
        if !self.workflows.read().contains_key(workflow_id) {
            return Err(PipelineError::WorkflowNotFound(workflow_id.to_string()));
        }
        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        };
        self.executions
            .write()
            .insert(execution.id.clone(), execution.clone());
        Ok(execution)
    }

    async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<String>,
        result: Option<Value>,
    ) -> Result<Execution> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| PipelineError::ExecutionNotFound(id.to_string()))?;

        if execution.status.is_terminal() {
            return Err(PipelineError::AlreadyFinished(id.to_string()));
        }
        if !execution.status.can_transition_to(status) {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: execution.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now();
        match status {
            ExecutionStatus::Running => execution.started_at = Some(now),
            ExecutionStatus::Completed | ExecutionStatus::Failed => execution.completed_at = Some(now),
            ExecutionStatus::Pending => {}
        }
        execution.status = status;
        if error.is_some() {
            execution.error = error;
        }
        if result.is_some() {
            execution.result = result;
        }
        Ok(execution.clone())
    }

    async fn get_execution(&self, id: &str) -> Result<Execution> {
        self.executions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::ExecutionNotFound(id.to_string()))
    }
}
