//! Sandbox executor: validate, pick a mode, run, normalize.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, StepDispatcher};
use crate::config::{ExecutionMode, SandboxConfig};
use crate::error::{FailureKind, SandboxError, SandboxResult};
use crate::runtime::{RuntimeLimits, run_chunk};
use crate::subprocess::run_subprocess;
use crate::validator::{Validator, Violation};

/// Normalized outcome of one sandboxed execution.
///
/// Both execution modes converge on this shape. `mutated_context` is only
/// present on success; `violations` is only non-empty when static
/// validation rejected the source.
#[derive(Debug, Clone)]
pub struct SandboxReport {
    pub success: bool,
    pub mutated_context: Option<Value>,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub violations: Vec<String>,
    pub failure: Option<FailureKind>,
}

impl SandboxReport {
    fn from_outcome(outcome: SandboxResult<Value>, execution_time: Duration) -> Self {
        match outcome {
            Ok(context) => Self {
                success: true,
                mutated_context: Some(context),
                error: None,
                execution_time,
                violations: Vec::new(),
                failure: None,
            },
            Err(e) => {
                let failure = e.kind();
                let violations = match &e {
                    SandboxError::SecurityViolation(list) => list.clone(),
                    _ => Vec::new(),
                };
                Self {
                    success: false,
                    mutated_context: None,
                    error: Some(e.to_string()),
                    execution_time,
                    violations,
                    failure: Some(failure),
                }
            }
        }
    }

    /// Convert back into a `Result`.
    pub fn into_result(self) -> SandboxResult<Value> {
        if self.success {
            return Ok(self.mutated_context.unwrap_or(Value::Null));
        }
        let message = self.error.unwrap_or_default();
        Err(match self.failure {
            Some(FailureKind::SecurityViolation) => SandboxError::SecurityViolation(self.violations),
            Some(FailureKind::ExecutionTimeout) => SandboxError::ExecutionTimeout(self.execution_time),
            _ => SandboxError::RuntimeFailure(message),
        })
    }
}

/// Runs untrusted generated code.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
    validator: Validator,
}

impl SandboxExecutor {
    /// Create an executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        let validator = Validator::new(&config);
        Self { config, validator }
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Static validation only.
    pub fn check(&self, source: &str) -> Vec<Violation> {
        self.validator.check(source)
    }

    /// Validate and run `source`, always returning a normalized report.
    pub async fn execute(
        &self,
        source: &str,
        context: &Value,
        dispatcher: Option<Arc<dyn StepDispatcher>>,
    ) -> SandboxReport {
        let started = Instant::now();
        let outcome = self.try_execute(source, context, dispatcher).await;
        let report = SandboxReport::from_outcome(outcome, started.elapsed());
        match report.failure {
            None => info!(elapsed = ?report.execution_time, "Sandbox execution succeeded"),
            Some(kind) => warn!(
                failure = %kind,
                error = report.error.as_deref().unwrap_or(""),
                "Sandbox execution failed"
            ),
        }
        report
    }

    /// Validate and run `source`, returning the mutated context.
    pub async fn try_execute(
        &self,
        source: &str,
        context: &Value,
        dispatcher: Option<Arc<dyn StepDispatcher>>,
    ) -> SandboxResult<Value> {
        self.validator.validate(source)?;
        debug!(mode = ?self.config.mode, "Source passed static validation");

        match self.config.mode {
            ExecutionMode::InProcess => self.run_in_process(source, context, dispatcher).await,
            ExecutionMode::Subprocess => {
                run_subprocess(&self.config, source, context, dispatcher).await
            }
        }
    }

    async fn run_in_process(
        &self,
        source: &str,
        context: &Value,
        dispatcher: Option<Arc<dyn StepDispatcher>>,
    ) -> SandboxResult<Value> {
        let limits = RuntimeLimits {
            timeout: self.config.timeout,
            memory_limit_bytes: self.config.memory_limit_bytes,
            allowed_modules: self.config.allowed_modules.clone(),
        };
        let capabilities = match dispatcher {
            Some(d) => Capabilities::new().with_async_dispatcher(d),
            None => Capabilities::new(),
        };
        let source = source.to_string();
        let context = context.clone();
        let task =
            tokio::task::spawn_blocking(move || run_chunk(&source, &context, &limits, capabilities));

        // The interpreter stops itself at the deadline; this covers time spent
        // blocked inside a dispatch call. Blocking threads cannot be cancelled,
        // so a chunk stuck outside the interpreter keeps its thread until the
        // call returns.
        let budget = self.config.timeout + self.config.kill_grace;
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SandboxError::RuntimeFailure(format!(
                "Interpreter task failed: {e}"
            ))),
            Err(_) => {
                warn!(
                    ?budget,
                    "In-process sandbox timed out; abandoning the interpreter thread"
                );
                Err(SandboxError::ExecutionTimeout(self.config.timeout))
            }
        }
    }
}
