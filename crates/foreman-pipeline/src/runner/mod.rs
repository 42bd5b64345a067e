//! Step runners and the registry that maps step-type tags to them.
//!
//! Every step type implements [`StepRunner`]. Runners never return errors:
//! anything that goes wrong becomes a failed [`StepResult`] so the engine
//! alone decides whether the workflow continues.
//!
//! The [`RunnerRegistry`] is built once through [`RunnerRegistryBuilder`] and
//! is read-only afterwards. [`default_registry`] wires every built-in type:
//!
//! | Tag | Runner |
//! |-----|--------|
//! | `shell` | [`ShellRunner`] |
//! | `http` | [`HttpRunner`] |
//! | `llm` | [`LlmRunner`] |
//! | `approval` | [`ApprovalRunner`] |
//! | `condition` | [`ConditionRunner`] |
//! | `rag_decision` | [`RagDecisionRunner`] |
//! | `desktop`, `browser` | [`AutomationRunner`] |
//! | `dynamic` | [`DynamicRunner`] |

mod approval;
mod automation;
mod condition;
mod dynamic;
mod http;
mod llm;
mod retrieval;
mod shell;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use foreman_sandbox::{SandboxConfig, SandboxExecutor};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::approval::{ApprovalBook, ApprovalNotifier, LogNotifier};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::generator::ModuleStore;

pub use approval::ApprovalRunner;
pub use automation::{ActionResult, AutomationAction, AutomationBackend, AutomationRunner};
pub use condition::{ConditionRunner, evaluate_condition};
pub use dynamic::{DynamicRunner, RegistryDispatcher};
pub use http::HttpRunner;
pub use llm::{CompletionRequest, LanguageModel, LlmRunner, OpenAiClient};
pub use retrieval::{Document, KeywordRetriever, RagDecisionRunner, Retriever};
pub use shell::ShellRunner;

// ─────────────────────────────────────────────────────────────────────────────
// Step result
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Accepted but awaiting an external decision.
    Pending,
    /// Not run because an upstream step failed or its branch was not taken.
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Pending => "pending",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// What every runner invocation returns.
///
/// A failed result may carry diagnostic detail in `result` (captured
/// output, response body), but that detail is never written into the
/// execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
    pub status: StepStatus,
    /// Downstream step this result routes to. When set, edges leaving the
    /// step carry only to this target.
    pub branch: Option<String>,
}

impl StepResult {
    pub fn completed(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            duration: Duration::ZERO,
            status: StepStatus::Completed,
            branch: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            duration: Duration::ZERO,
            status: StepStatus::Failed,
            branch: None,
        }
    }

    /// A failure that keeps diagnostic detail.
    pub fn failed_with(error: impl Into<String>, detail: Value) -> Self {
        Self {
            result: Some(detail),
            ..Self::failed(error)
        }
    }

    pub fn pending(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            duration: Duration::ZERO,
            status: StepStatus::Pending,
            branch: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(reason.into()),
            duration: Duration::ZERO,
            status: StepStatus::Skipped,
            branch: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_branch(mut self, target: impl Into<String>) -> Self {
        self.branch = Some(target.into());
        self
    }

    /// The output to record in the execution context, if any.
    pub fn output(&self) -> Option<Value> {
        if self.success {
            Some(self.result.clone().unwrap_or(Value::Null))
        } else {
            None
        }
    }

    /// `{success, result, error, duration_ms, status}`.
    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "result": self.result,
            "error": self.error,
            "duration_ms": self.duration.as_millis() as u64,
            "status": self.status,
        })
    }
}

/// Read a required string parameter.
pub(crate) fn required_str<'a>(params: &'a Value, name: &str) -> std::result::Result<&'a str, String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("Missing required parameter '{name}'"))
}

/// Read an optional `timeout_secs` parameter.
pub(crate) fn timeout_param(params: &Value, default: Duration) -> Duration {
    params
        .get("timeout_secs")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner contract
// ─────────────────────────────────────────────────────────────────────────────

/// A step-type executor.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// The tag this runner is registered under.
    fn step_type(&self) -> &str;

    /// Run one step. `params` are the node's raw parameters; runners
    /// resolve placeholders against `ctx` themselves.
    async fn execute(&self, step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult;
}

/// Constructor for a runner.
pub type RunnerFactory = Arc<dyn Fn() -> Arc<dyn StepRunner> + Send + Sync>;

/// Immutable map from step-type tag to runner constructor.
pub struct RunnerRegistry {
    factories: HashMap<String, RunnerFactory>,
}

impl RunnerRegistry {
    pub fn builder() -> RunnerRegistryBuilder {
        RunnerRegistryBuilder::default()
    }

    /// Construct the runner for `step_type`.
    pub fn create(&self, step_type: &str) -> Result<Arc<dyn StepRunner>> {
        self.factories
            .get(step_type)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownStepType(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    /// Registered tags, sorted.
    pub fn step_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.factories.keys().cloned().collect();
        tags.sort();
        tags
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

/// Collects registrations before the registry is frozen.
#[derive(Default)]
pub struct RunnerRegistryBuilder {
    factories: HashMap<String, RunnerFactory>,
}

impl RunnerRegistryBuilder {
    /// Register a constructor under `step_type`, replacing any previous one.
    pub fn register<F>(mut self, step_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn StepRunner> + Send + Sync + 'static,
    {
        self.factories.insert(step_type.into(), Arc::new(factory));
        self
    }

    /// Register a shared runner instance under its own tag.
    pub fn register_runner(self, runner: Arc<dyn StepRunner>) -> Self {
        let tag = runner.step_type().to_string();
        self.register(tag, move || Arc::clone(&runner))
    }

    pub fn build(self) -> RunnerRegistry {
        RunnerRegistry {
            factories: self.factories,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Default wiring
// ─────────────────────────────────────────────────────────────────────────────

/// Collaborators the built-in runners depend on.
#[derive(Clone)]
pub struct RunnerDeps {
    pub language_model: Option<Arc<dyn LanguageModel>>,
    pub retriever: Arc<dyn Retriever>,
    pub desktop: Option<Arc<dyn AutomationBackend>>,
    pub browser: Option<Arc<dyn AutomationBackend>>,
    pub approvals: Arc<ApprovalBook>,
    pub notifier: Arc<dyn ApprovalNotifier>,
    pub sandbox: Arc<SandboxExecutor>,
    pub modules: ModuleStore,
    pub step_timeout: Duration,
    pub approval_timeout: Duration,
}

impl RunnerDeps {
    /// Dependencies with no language model, no automation backends, an
    /// empty keyword retriever and a logging approval notifier.
    pub fn new(sandbox: SandboxConfig, module_dir: impl Into<PathBuf>) -> Self {
        Self {
            language_model: None,
            retriever: Arc::new(KeywordRetriever::new()),
            desktop: None,
            browser: None,
            approvals: Arc::new(ApprovalBook::new()),
            notifier: Arc::new(LogNotifier),
            sandbox: Arc::new(SandboxExecutor::new(sandbox)),
            modules: ModuleStore::new(module_dir),
            step_timeout: Duration::from_secs(300),
            approval_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.language_model = Some(model);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_desktop(mut self, backend: Arc<dyn AutomationBackend>) -> Self {
        self.desktop = Some(backend);
        self
    }

    pub fn with_browser(mut self, backend: Arc<dyn AutomationBackend>) -> Self {
        self.browser = Some(backend);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalBook>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }
}

/// Build a registry with every built-in step type.
///
/// The `dynamic` runner dispatches back into the registry it lives in, so
/// it holds a weak reference to it.
pub fn default_registry(deps: RunnerDeps) -> Arc<RunnerRegistry> {
    Arc::new_cyclic(|registry| {
        let shell: Arc<dyn StepRunner> = Arc::new(ShellRunner::new(deps.step_timeout));
        let http: Arc<dyn StepRunner> = Arc::new(HttpRunner::new(deps.step_timeout));
        let llm: Arc<dyn StepRunner> = Arc::new(LlmRunner::new(deps.language_model.clone()));
        let approval: Arc<dyn StepRunner> = Arc::new(ApprovalRunner::new(
            Arc::clone(&deps.approvals),
            Arc::clone(&deps.notifier),
            deps.approval_timeout,
        ));
        let condition: Arc<dyn StepRunner> = Arc::new(ConditionRunner);
        let rag: Arc<dyn StepRunner> = Arc::new(RagDecisionRunner::new(
            Arc::clone(&deps.retriever),
            deps.language_model.clone(),
        ));
        let desktop: Arc<dyn StepRunner> = Arc::new(AutomationRunner::new(
            "desktop",
            deps.desktop.clone(),
            deps.step_timeout,
        ));
        let browser: Arc<dyn StepRunner> = Arc::new(AutomationRunner::new(
            "browser",
            deps.browser.clone(),
            deps.step_timeout,
        ));
        let dynamic: Arc<dyn StepRunner> = Arc::new(DynamicRunner::new(
            deps.modules.clone(),
            Arc::clone(&deps.sandbox),
            registry.clone(),
        ));

        RunnerRegistry::builder()
            .register_runner(shell)
            .register_runner(http)
            .register_runner(llm)
            .register_runner(approval)
            .register_runner(condition)
            .register_runner(rag)
            .register_runner(desktop)
            .register_runner(browser)
            .register_runner(dynamic)
            .build()
    })
}
