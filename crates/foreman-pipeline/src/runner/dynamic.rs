//! Runner for generated modules.

use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use foreman_sandbox::{DispatchRequest, SandboxExecutor, StepDispatcher, dispatch_unavailable};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{RunnerRegistry, StepResult, StepRunner};
use crate::context::ExecutionContext;
use crate::generator::ModuleStore;

/// Serves `foreman.dispatch` calls from generated code through the runner
/// registry.
///
/// Each dispatch sees the parent step's context plus the outputs of
/// sub-steps dispatched before it in the same module run.
pub struct RegistryDispatcher {
    registry: Weak<RunnerRegistry>,
    context: Mutex<ExecutionContext>,
}

impl RegistryDispatcher {
    pub fn new(registry: Weak<RunnerRegistry>, context: ExecutionContext) -> Self {
        Self {
            registry,
            context: Mutex::new(context),
        }
    }

    /// The context as accumulated so far.
    pub fn context(&self) -> ExecutionContext {
        self.context.lock().clone()
    }
}

#[async_trait]
impl StepDispatcher for RegistryDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Value {
        if request.step_type == "dynamic" {
            return dispatch_unavailable("Dynamic steps cannot dispatch other dynamic steps");
        }
        let Some(registry) = self.registry.upgrade() else {
            return dispatch_unavailable("Runner registry is no longer available");
        };
        let runner = match registry.create(&request.step_type) {
            Ok(r) => r,
            Err(e) => return dispatch_unavailable(&e.to_string()),
        };

        let ctx = self.context();
        let result = runner.execute(&request.step_id, &request.params, &ctx).await;
        debug!(
            step_id = %request.step_id,
            step_type = %request.step_type,
            success = result.success,
            "Dispatched sub-step"
        );
        if let Some(output) = result.output() {
            self.context.lock().record_output(&request.step_id, output);
        }
        result.to_json()
    }
}

/// Executes the generated module for `(workflow_id, step_id)` in the sandbox.
///
/// The module receives the context snapshot and dispatches its sub-steps
/// back through the registry. Output is the map of sub-step outcomes; the
/// step fails when the module stops at a failed sub-step.
pub struct DynamicRunner {
    modules: ModuleStore,
    executor: Arc<SandboxExecutor>,
    registry: Weak<RunnerRegistry>,
}

impl DynamicRunner {
    pub fn new(modules: ModuleStore, executor: Arc<SandboxExecutor>, registry: Weak<RunnerRegistry>) -> Self {
        Self {
            modules,
            executor,
            registry,
        }
    }
}

#[async_trait]
impl StepRunner for DynamicRunner {
    fn step_type(&self) -> &str {
        "dynamic"
    }

    async fn execute(&self, step_id: &str, _params: &Value, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let module = match self.modules.load(ctx.workflow_id(), step_id) {
            Ok(Some(m)) => m,
            Ok(None) => {
                return StepResult::failed(format!(
                    "No generated module for {}/{step_id}; run generation first",
                    ctx.workflow_id()
                ));
            }
            Err(e) => return StepResult::failed(e.to_string()),
        };

        let dispatcher = Arc::new(RegistryDispatcher::new(self.registry.clone(), ctx.clone()));
        let report = self
            .executor
            .execute(&module.source, &ctx.snapshot(), Some(dispatcher as Arc<dyn StepDispatcher>))
            .await;
        if !report.success {
            let mut error = report.error.unwrap_or_else(|| "Sandbox execution failed".to_string());
            if !report.violations.is_empty() {
                error = format!("{error}: {}", report.violations.join("; "));
            }
            warn!(step_id, error = %error, "Generated module failed");
            return StepResult::failed(error).with_duration(started.elapsed());
        }

        let mutated = report.mutated_context.unwrap_or(Value::Null);
        let outcomes = mutated.get("outcomes").cloned().unwrap_or_else(|| json!({}));
        let result = match mutated.get("failed_step").and_then(Value::as_str) {
            Some(failed) => {
                let reason = outcomes
                    .get(failed)
                    .and_then(|o| o.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                StepResult::failed_with(format!("Sub-step '{failed}' failed: {reason}"), outcomes)
            }
            None => StepResult::completed(outcomes),
        };
        result.with_duration(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::ModuleGenerator;
    use crate::runner::{RunnerDeps, default_registry};
    use foreman_sandbox::{ExecutionMode, SandboxConfig};
    use std::time::Duration;

    fn config() -> SandboxConfig {
        SandboxConfig::default()
            .with_mode(ExecutionMode::InProcess)
            .with_timeout(Duration::from_secs(10))
    }

    fn registry(dir: &std::path::Path) -> Arc<RunnerRegistry> {
        default_registry(RunnerDeps::new(config(), dir))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runs_generated_module() {
        let dir = tempfile::tempdir().unwrap();
        let spec = json!({"steps": [
            {"id": "greet", "type": "shell", "data": {"command": "printf 'hi %s' \"${who}\""}},
            {"id": "shout", "type": "shell", "data": {"command": "printf '%s!' \"${greet.stdout}\""}},
        ]});
        ModuleGenerator::new(config(), ModuleStore::new(dir.path()))
            .generate("wf", "dyn", &spec)
            .await
            .unwrap();

        let registry = registry(dir.path());
        let runner = registry.create("dynamic").unwrap();
        let ctx = ExecutionContext::new("wf", "e").with_input(json!({"who": "ada"}));
        let result = runner.execute("dyn", &json!({}), &ctx).await;
        assert!(result.success, "{:?}", result.error);
        let out = result.result.unwrap();
        assert_eq!(out["greet"]["result"]["stdout"], "hi ada");
        assert_eq!(out["shout"]["result"]["stdout"], "hi ada!");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_sub_step_fails_step() {
        let dir = tempfile::tempdir().unwrap();
        let spec = json!({"steps": [
            {"id": "boom", "type": "shell", "data": {"command": "exit 4"}},
            {"id": "after", "type": "shell", "data": {"command": "true"}},
        ]});
        ModuleGenerator::new(config(), ModuleStore::new(dir.path()))
            .generate("wf", "dyn", &spec)
            .await
            .unwrap();

        let registry = registry(dir.path());
        let result = registry
            .create("dynamic")
            .unwrap()
            .execute("dyn", &json!({}), &ExecutionContext::new("wf", "e"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Sub-step 'boom' failed"));
        assert!(result.result.unwrap().get("after").is_none());
    }

    #[tokio::test]
    async fn test_missing_module() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let result = registry
            .create("dynamic")
            .unwrap()
            .execute("nothing", &json!({}), &ExecutionContext::new("wf", "e"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No generated module"));
    }

    #[tokio::test]
    async fn test_dispatcher_refuses_nested_dynamic_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let dispatcher = RegistryDispatcher::new(Arc::downgrade(&registry), ExecutionContext::default());

        let nested = dispatcher
            .dispatch(DispatchRequest {
                step_id: "x".into(),
                step_type: "dynamic".into(),
                params: json!({}),
            })
            .await;
        assert_eq!(nested["success"], false);

        let unknown = dispatcher
            .dispatch(DispatchRequest {
                step_id: "x".into(),
                step_type: "teleport".into(),
                params: json!({}),
            })
            .await;
        assert!(unknown["error"].as_str().unwrap().contains("Unknown step type"));
    }

    #[tokio::test]
    async fn test_dispatcher_records_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let dispatcher = RegistryDispatcher::new(Arc::downgrade(&registry), ExecutionContext::default());
        let outcome = dispatcher
            .dispatch(DispatchRequest {
                step_id: "route".into(),
                step_type: "condition".into(),
                params: json!({"conditions": [], "default": "left"}),
            })
            .await;
        assert_eq!(outcome["status"], "completed");
        assert_eq!(dispatcher.context().get("route.target"), Some(&json!("left")));
    }
}
