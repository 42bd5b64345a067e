//! Wire protocol between the parent executor and the `sandbox-exec` worker.
//!
//! - The worker writes a `WorkerResult` as JSON to the `--output` file.
//! - While running, each `foreman.dispatch` call becomes one `WorkerMessage`
//!   line on the worker's stdout; the parent answers with one `DispatchReply`
//!   line on the worker's stdin.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureKind;

/// Result envelope written by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Execution status: "ok" or "error".
    pub status: String,
    /// Mutated context (present on success).
    #[serde(default)]
    pub context: Option<Value>,
    /// Error message if status is "error".
    #[serde(default)]
    pub error: Option<String>,
    /// Failure classification if status is "error".
    #[serde(default)]
    pub failure: Option<FailureKind>,
    /// Time spent inside the interpreter.
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl WorkerResult {
    /// A successful result.
    pub fn ok(context: Value, elapsed_ms: u64) -> Self {
        Self {
            status: "ok".to_string(),
            context: Some(context),
            error: None,
            failure: None,
            elapsed_ms,
        }
    }

    /// A failed result.
    pub fn error(failure: FailureKind, message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            status: "error".to_string(),
            context: None,
            error: Some(message.into()),
            failure: Some(failure),
            elapsed_ms,
        }
    }

    /// Returns true if the worker reported success.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Message sent by the worker on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Ask the parent to run a step.
    Dispatch {
        id: u64,
        step_id: String,
        step_type: String,
        #[serde(default)]
        params: Value,
    },
}

/// Parent's answer to a `WorkerMessage::Dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReply {
    pub id: u64,
    pub outcome: Value,
}
