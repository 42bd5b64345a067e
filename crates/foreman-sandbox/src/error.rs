//! Error types for sandbox operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while validating or running generated code.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Static validation rejected the source; it was never executed.
    #[error("Security violation: {}", .0.join("; "))]
    SecurityViolation(Vec<String>),

    /// The code exceeded its wall-clock or CPU budget and was stopped.
    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// The code itself raised an error.
    #[error("Runtime failure: {0}")]
    RuntimeFailure(String),

    /// The out-of-process worker could not be started or misbehaved.
    #[error("Sandbox worker failed: {0}")]
    WorkerFailed(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Classify this error for reporting.
    pub fn kind(&self) -> FailureKind {
        match self {
            SandboxError::SecurityViolation(_) => FailureKind::SecurityViolation,
            SandboxError::ExecutionTimeout(_) => FailureKind::ExecutionTimeout,
            _ => FailureKind::RuntimeFailure,
        }
    }

    /// Rebuild an error from its reported kind and message.
    pub fn from_kind(kind: FailureKind, message: String, timeout: Duration) -> Self {
        match kind {
            FailureKind::SecurityViolation => SandboxError::SecurityViolation(vec![message]),
            FailureKind::ExecutionTimeout => SandboxError::ExecutionTimeout(timeout),
            FailureKind::RuntimeFailure => SandboxError::RuntimeFailure(message),
        }
    }
}

/// Failure classification carried in reports and on the worker wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SecurityViolation,
    ExecutionTimeout,
    RuntimeFailure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::SecurityViolation => "security_violation",
            FailureKind::ExecutionTimeout => "execution_timeout",
            FailureKind::RuntimeFailure => "runtime_failure",
        };
        f.write_str(s)
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
