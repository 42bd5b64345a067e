//! Shell command runner.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{StepResult, StepRunner, required_str, timeout_param};
use crate::context::ExecutionContext;

/// Runs `command` through `sh -c`.
///
/// Parameters: `command` (required), `cwd`, `env` (object of strings),
/// `timeout_secs`. Output: `{stdout, stderr, exit_code}`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    default_timeout: Duration,
}

impl ShellRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    fn step_type(&self) -> &str {
        "shell"
    }

    async fn execute(&self, step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let params = ctx.interpolate(params);
        let command = match required_str(&params, "command") {
            Ok(c) => c,
            Err(e) => return StepResult::failed(e),
        };
        let limit = timeout_param(&params, self.default_timeout);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = params.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(dir);
        }
        if let Some(env) = params.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                cmd.env(key, value);
            }
        }

        debug!(step_id, command, timeout = ?limit, "Running shell step");
        let result = match timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let detail = json!({
                    "stdout": stdout,
                    "stderr": stderr,
                    "exit_code": exit_code,
                });
                if output.status.success() {
                    StepResult::completed(detail)
                } else {
                    StepResult::failed_with(
                        format!("Command failed with exit code {exit_code}: {}", stderr.trim()),
                        detail,
                    )
                }
            }
            Ok(Err(e)) => StepResult::failed(format!("Failed to execute command: {e}")),
            Err(_) => StepResult::failed(format!("Command timed out after {limit:?}")),
        };
        result.with_duration(started.elapsed())
    }
}
