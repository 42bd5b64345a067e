//! Desktop and browser automation runner.
//!
//! The runner owns sequencing, timeouts and failure policy. The actual
//! clicking and typing is delegated to an [`AutomationBackend`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{StepResult, StepRunner, timeout_param};
use crate::context::ExecutionContext;

fn default_true() -> bool {
    true
}

/// One action in an automation step (`click`, `type`, `navigate`,
/// `extract`, `screenshot`, `wait`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(rename = "type")]
    pub action_type: String,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ActionResult {
    pub fn ok(action_type: impl Into<String>, output: Value) -> Self {
        Self {
            action_type: action_type.into(),
            success: true,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failed(action_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }
}

/// Drives a desktop session or a browser.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn execute_action(&self, action: &AutomationAction) -> ActionResult;
}

/// Runs `actions` in order against a backend.
///
/// Parameters: `actions` (required list of [`AutomationAction`]),
/// `timeout_secs` (budget for the whole step). Output:
/// `{actions, completed, failed}`.
pub struct AutomationRunner {
    step_type: &'static str,
    backend: Option<Arc<dyn AutomationBackend>>,
    default_timeout: Duration,
}

impl AutomationRunner {
    pub fn new(
        step_type: &'static str,
        backend: Option<Arc<dyn AutomationBackend>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            step_type,
            backend,
            default_timeout,
        }
    }
}

#[async_trait]
impl StepRunner for AutomationRunner {
    fn step_type(&self) -> &str {
        self.step_type
    }

    async fn execute(&self, step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let Some(backend) = &self.backend else {
            return StepResult::failed(format!("No {} automation backend is configured", self.step_type));
        };
        let params = ctx.interpolate(params);
        let actions: Vec<AutomationAction> = match params.get("actions") {
            Some(list @ Value::Array(_)) => match serde_json::from_value(list.clone()) {
                Ok(a) => a,
                Err(e) => return StepResult::failed(format!("Invalid actions: {e}")),
            },
            _ => return StepResult::failed("Missing required parameter 'actions'"),
        };
        let budget = timeout_param(&params, self.default_timeout);

        let mut results = Vec::with_capacity(actions.len());
        let mut error = None;
        for (index, action) in actions.iter().enumerate() {
            let Some(remaining) = budget.checked_sub(started.elapsed()) else {
                error = Some(format!(
                    "Timed out after {budget:?} before action {index} ({})",
                    action.action_type
                ));
                break;
            };

            let action_started = Instant::now();
            let mut result = match tokio::time::timeout(remaining, backend.execute_action(action)).await {
                Ok(r) => r,
                Err(_) => ActionResult::failed(&action.action_type, format!("Timed out after {budget:?}")),
            };
            result.duration_ms = action_started.elapsed().as_millis() as u64;
            debug!(
                step_id,
                backend = backend.name(),
                action = %action.action_type,
                success = result.success,
                "Automation action finished"
            );

            let failed = !result.success;
            let reason = result.error.clone().unwrap_or_default();
            results.push(result);
            if failed {
                if action.stop_on_failure {
                    error = Some(format!("Action {index} ({}) failed: {reason}", action.action_type));
                    break;
                }
                warn!(step_id, index, error = %reason, "Automation action failed, continuing");
            }
        }

        let completed = results.iter().filter(|r| r.success).count();
        let detail = json!({
            "actions": results,
            "completed": completed,
            "failed": results.len() - completed,
        });
        let result = match error {
            Some(e) => StepResult::failed_with(e, detail),
            None => StepResult::completed(detail),
        };
        result.with_duration(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Fails any action whose params contain `"fail": true`.
    #[derive(Default)]
    struct Scripted {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AutomationBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute_action(&self, action: &AutomationAction) -> ActionResult {
            self.seen.lock().push(action.action_type.clone());
            if action.action_type == "wait" {
                let ms = action.params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if action.params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                ActionResult::failed(&action.action_type, "element not found")
            } else {
                ActionResult::ok(&action.action_type, action.params.clone())
            }
        }
    }

    fn runner(backend: &Arc<Scripted>) -> AutomationRunner {
        AutomationRunner::new("browser", Some(backend.clone()), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_runs_actions_in_order() {
        let backend = Arc::new(Scripted::default());
        let ctx = ExecutionContext::new("wf", "e").with_input(json!({"site": "https://example.com"}));
        let params = json!({"actions": [
            {"type": "navigate", "params": {"url": "${site}"}},
            {"type": "click", "params": {"selector": "#go"}},
            {"type": "extract", "params": {"selector": "h1"}},
        ]});

        let result = runner(&backend).execute("b", &params, &ctx).await;
        assert!(result.success, "{:?}", result.error);
        let out = result.result.unwrap();
        assert_eq!(out["completed"], 3);
        assert_eq!(out["failed"], 0);
        assert_eq!(out["actions"][0]["output"]["url"], "https://example.com");
        assert_eq!(*backend.seen.lock(), vec!["navigate", "click", "extract"]);
    }

    #[tokio::test]
    async fn test_stop_on_failure_skips_rest() {
        let backend = Arc::new(Scripted::default());
        let params = json!({"actions": [
            {"type": "click", "params": {"fail": true}},
            {"type": "type", "params": {"text": "never"}},
        ]});
        let result = runner(&backend).execute("b", &params, &ExecutionContext::default()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Action 0 (click) failed: element not found"));
        assert_eq!(backend.seen.lock().len(), 1);
        assert_eq!(result.result.unwrap()["failed"], 1);
    }

    #[tokio::test]
    async fn test_continue_past_tolerated_failure() {
        let backend = Arc::new(Scripted::default());
        let params = json!({"actions": [
            {"type": "screenshot", "params": {"fail": true}, "stop_on_failure": false},
            {"type": "click", "params": {}},
        ]});
        let result = runner(&backend).execute("b", &params, &ExecutionContext::default()).await;
        assert!(result.success);
        let out = result.result.unwrap();
        assert_eq!(out["completed"], 1);
        assert_eq!(out["failed"], 1);
        assert_eq!(out["actions"][0]["error"], "element not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_budget_applies_across_actions() {
        let backend = Arc::new(Scripted::default());
        let params = json!({"timeout_secs": 1, "actions": [
            {"type": "wait", "params": {"ms": 5000}},
            {"type": "click", "params": {}},
        ]});
        let result = runner(&backend).execute("b", &params, &ExecutionContext::default()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Timed out"));
        assert_eq!(*backend.seen.lock(), vec!["wait"]);
    }

    #[tokio::test]
    async fn test_without_backend() {
        let runner = AutomationRunner::new("desktop", None, Duration::from_secs(1));
        let result = runner
            .execute("d", &json!({"actions": []}), &ExecutionContext::default())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No desktop automation backend"));
    }
}
