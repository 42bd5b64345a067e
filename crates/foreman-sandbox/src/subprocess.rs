//! Parent side of the out-of-process sandbox.
//!
//! Source and context are written to a scratch directory, the worker binary is
//! spawned with `sandbox-exec` and a cleared environment, dispatch requests on
//! its stdout are answered on its stdin, and the result file is read back once
//! it exits. The parent enforces its own overall deadline and kills the
//! worker when it expires.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::capabilities::{DispatchRequest, StepDispatcher, dispatch_unavailable};
use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::protocol::{DispatchReply, WorkerMessage, WorkerResult};

/// Run `source` in a worker process.
pub async fn run_subprocess(
    config: &SandboxConfig,
    source: &str,
    context: &Value,
    dispatcher: Option<Arc<dyn StepDispatcher>>,
) -> SandboxResult<Value> {
    let binary = config.resolve_worker_binary()?;
    let scratch = tempfile::tempdir()?;
    let source_path = scratch.path().join("module.lua");
    let context_path = scratch.path().join("context.json");
    let output_path = scratch.path().join("result.json");
    tokio::fs::write(&source_path, source).await?;
    tokio::fs::write(&context_path, serde_json::to_vec(context)?).await?;

    let mut cmd = Command::new(&binary);
    cmd.arg("sandbox-exec")
        .arg("--source")
        .arg(&source_path)
        .arg("--context")
        .arg(&context_path)
        .arg("--output")
        .arg(&output_path)
        .arg("--timeout-ms")
        .arg(config.timeout.as_millis().to_string())
        .arg("--memory-bytes")
        .arg(config.memory_limit_bytes.to_string())
        .arg("--cpu-secs")
        .arg(config.cpu_time.as_secs().max(1).to_string());
    for module in &config.allowed_modules {
        cmd.arg("--allow-module").arg(module);
    }
    cmd.env_clear()
        .current_dir(scratch.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        SandboxError::WorkerFailed(format!("Failed to spawn {}: {e}", binary.display()))
    })?;
    debug!(binary = %binary.display(), pid = ?child.id(), "Spawned sandbox worker");

    let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(SandboxError::WorkerFailed(
            "worker stdio was not captured".to_string(),
        ));
    };

    let stderr_task = tokio::spawn(async move {
        let mut text = String::new();
        let _ = stderr.read_to_string(&mut text).await;
        text
    });

    let conversation = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let message: WorkerMessage = match serde_json::from_str(&line) {
                Ok(m) => m,
                Err(_) => {
                    debug!(line = %line, "Ignoring non-protocol worker output");
                    continue;
                }
            };
            let WorkerMessage::Dispatch {
                id,
                step_id,
                step_type,
                params,
            } = message;
            let outcome = match &dispatcher {
                Some(d) => {
                    d.dispatch(DispatchRequest {
                        step_id,
                        step_type,
                        params,
                    })
                    .await
                }
                None => dispatch_unavailable("dispatch is not available in this sandbox"),
            };
            let reply =
                serde_json::to_string(&DispatchReply { id, outcome }).map_err(std::io::Error::other)?;
            stdin.write_all(reply.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
        }
        child.wait().await
    };

    let budget = config.timeout + config.kill_grace;
    let outcome = tokio::time::timeout(budget, conversation).await;

    let status = match outcome {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(SandboxError::WorkerFailed(format!("Worker IO failed: {e}")));
        }
        Err(_) => {
            warn!(timeout = ?config.timeout, "Sandbox worker exceeded its budget, killing");
            let _ = child.kill().await;
            return Err(SandboxError::ExecutionTimeout(config.timeout));
        }
    };

    let stderr_text = stderr_task.await.unwrap_or_default();
    if !stderr_text.trim().is_empty() {
        debug!(stderr = %stderr_text.trim(), "Sandbox worker stderr");
    }

    interpret(config, status, &output_path, &stderr_text).await
}

async fn interpret(
    config: &SandboxConfig,
    status: ExitStatus,
    output_path: &std::path::Path,
    stderr: &str,
) -> SandboxResult<Value> {
    match tokio::fs::read(output_path).await {
        Ok(bytes) => {
            let result: WorkerResult = serde_json::from_slice(&bytes)?;
            if result.is_ok() {
                return Ok(result.context.unwrap_or(Value::Null));
            }
            let message = result
                .error
                .unwrap_or_else(|| "worker reported an unspecified error".to_string());
            Err(match result.failure {
                Some(kind) => SandboxError::from_kind(kind, message, config.timeout),
                None => SandboxError::RuntimeFailure(message),
            })
        }
        Err(_) if killed_by_cpu_limit(&status) => {
            Err(SandboxError::ExecutionTimeout(config.cpu_time))
        }
        Err(_) => Err(SandboxError::WorkerFailed(format!(
            "worker exited with {status} without a result: {}",
            stderr.trim()
        ))),
    }
}

#[cfg(unix)]
fn killed_by_cpu_limit(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    matches!(status.signal(), Some(libc::SIGXCPU) | Some(libc::SIGKILL))
}

#[cfg(not(unix))]
fn killed_by_cpu_limit(_status: &ExitStatus) -> bool {
    false
}
