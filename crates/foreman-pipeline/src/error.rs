//! Error types for the pipeline engine.

use foreman_sandbox::SandboxError;
use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur during pipeline operations.
///
/// Step failures are not errors: runners report them as a failed
/// `StepResult` and the engine decides whether to continue.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed workflow definition or missing required parameter.
    #[error("Invalid workflow: {0}")]
    Validation(String),

    /// The dependency graph contains a cycle.
    #[error("Cycle detected among nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    /// No runner is registered for a step type tag.
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    /// Workflow not found.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Execution not found.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Execution status change that is not allowed.
    #[error("Execution {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// The execution already reached a terminal status.
    #[error("Execution {0} already finished")]
    AlreadyFinished(String),

    /// Persistence collaborator failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Task queue failure.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Sandbox rejection or failure.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Dynamic module generation failed.
    #[error("Module generation failed: {0}")]
    Generation(String),

    /// Trigger or scheduling failure.
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Approval lookup or resolution failure.
    #[error("Approval error: {0}")]
    Approval(String),

    /// External collaborator (language model, retriever, notifier) failure.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
