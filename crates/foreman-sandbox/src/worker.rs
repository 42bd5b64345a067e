//! Child-process side of the out-of-process sandbox.
//!
//! Invoked as `<binary> sandbox-exec ...`. The worker lowers its own resource
//! limits, runs the source in the restricted interpreter with its own
//! deadline, forwards `foreman.dispatch` calls to the parent over stdio, and
//! writes a `WorkerResult` to the output file.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::capabilities::{Capabilities, DispatchFn, DispatchRequest, dispatch_unavailable};
use crate::error::{SandboxError, SandboxResult};
use crate::protocol::{DispatchReply, WorkerMessage, WorkerResult};
use crate::runtime::{RuntimeLimits, run_chunk};

/// Address space granted on top of the interpreter ceiling for the binary
/// image, shared libraries and thread stacks.
const ADDRESS_SPACE_ALLOWANCE: u64 = 512 * 1024 * 1024;

/// Arguments of the `sandbox-exec` entry point.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub source: PathBuf,
    pub context: PathBuf,
    pub output: PathBuf,
    pub timeout: Duration,
    pub memory_bytes: usize,
    pub cpu_secs: u64,
    pub allowed_modules: Vec<String>,
}

/// Run the worker. Script failures are written to the output file; an `Err`
/// means the worker itself could not do its job.
pub fn run_worker(args: &WorkerArgs) -> SandboxResult<()> {
    apply_resource_limits(args.memory_bytes, args.cpu_secs);
    execute(args)
}

fn execute(args: &WorkerArgs) -> SandboxResult<()> {
    let source = std::fs::read_to_string(&args.source)?;
    let context: Value = serde_json::from_str(&std::fs::read_to_string(&args.context)?)?;
    let limits = RuntimeLimits {
        timeout: args.timeout,
        memory_limit_bytes: args.memory_bytes,
        allowed_modules: args.allowed_modules.clone(),
    };

    let started = Instant::now();
    let capabilities = Capabilities::new().with_dispatch(stdio_dispatch());
    let outcome = run_chunk(&source, &context, &limits, capabilities);
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let result = match outcome {
        Ok(mutated) => WorkerResult::ok(mutated, elapsed_ms),
        Err(e) => {
            debug!(error = %e, "Script failed");
            WorkerResult::error(e.kind(), failure_message(&e), elapsed_ms)
        }
    };

    std::fs::write(&args.output, serde_json::to_vec(&result)?)?;
    Ok(())
}

fn failure_message(err: &SandboxError) -> String {
    match err {
        SandboxError::RuntimeFailure(msg) | SandboxError::WorkerFailed(msg) => msg.clone(),
        other => other.to_string(),
    }
}

fn stdio_dispatch() -> DispatchFn {
    let next_id = AtomicU64::new(1);
    Box::new(move |request| {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        match exchange(id, request) {
            Ok(outcome) => outcome,
            Err(e) => dispatch_unavailable(&format!("dispatch channel error: {e}")),
        }
    })
}

fn exchange(id: u64, request: DispatchRequest) -> SandboxResult<Value> {
    let message = WorkerMessage::Dispatch {
        id,
        step_id: request.step_id,
        step_type: request.step_type,
        params: request.params,
    };
    {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer(&mut stdout, &message)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(SandboxError::WorkerFailed(
            "parent closed the dispatch channel".to_string(),
        ));
    }
    let reply: DispatchReply = serde_json::from_str(line.trim())?;
    if reply.id != id {
        return Err(SandboxError::WorkerFailed(format!(
            "reply id {} does not match request id {id}",
            reply.id
        )));
    }
    Ok(reply.outcome)
}

#[cfg(unix)]
fn apply_resource_limits(memory_bytes: usize, cpu_secs: u64) {
    let address_space = (memory_bytes as u64).saturating_add(ADDRESS_SPACE_ALLOWANCE);
    let memory = libc::rlimit {
        rlim_cur: address_space as libc::rlim_t,
        rlim_max: address_space as libc::rlim_t,
    };
    // Soft limit raises SIGXCPU, the hard limit one second later SIGKILL.
    let cpu = libc::rlimit {
        rlim_cur: cpu_secs.max(1) as libc::rlim_t,
        rlim_max: (cpu_secs.max(1) + 1) as libc::rlim_t,
    };

    // SAFETY: setrlimit only reads the passed struct.
    if unsafe { libc::setrlimit(libc::RLIMIT_AS, &memory) } != 0 {
        warn!(error = %std::io::Error::last_os_error(), "Failed to apply RLIMIT_AS");
    }
    // SAFETY: as above.
    if unsafe { libc::setrlimit(libc::RLIMIT_CPU, &cpu) } != 0 {
        warn!(error = %std::io::Error::last_os_error(), "Failed to apply RLIMIT_CPU");
    }
}

#[cfg(not(unix))]
fn apply_resource_limits(_memory_bytes: usize, _cpu_secs: u64) {
    warn!("OS resource limits are not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn args(dir: &TempDir, source: &str, context: Value) -> WorkerArgs {
        let source_path = dir.path().join("module.lua");
        let context_path = dir.path().join("context.json");
        std::fs::write(&source_path, source).unwrap();
        std::fs::write(&context_path, context.to_string()).unwrap();
        WorkerArgs {
            source: source_path,
            context: context_path,
            output: dir.path().join("result.json"),
            timeout: Duration::from_secs(2),
            memory_bytes: 16 * 1024 * 1024,
            cpu_secs: 5,
            allowed_modules: vec!["string".into()],
        }
    }

    fn read_result(args: &WorkerArgs) -> WorkerResult {
        serde_json::from_slice(&std::fs::read(&args.output).unwrap()).unwrap()
    }

    #[test]
    fn test_failure_message_strips_prefix() {
        let msg = failure_message(&SandboxError::RuntimeFailure("boom".into()));
        assert_eq!(msg, "boom");
        let msg = failure_message(&SandboxError::ExecutionTimeout(Duration::from_secs(1)));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn test_execute_writes_ok_result() {
        let dir = TempDir::new().unwrap();
        let a = args(&dir, "context.n = context.n * 2", json!({"n": 21}));
        execute(&a).unwrap();

        let result = read_result(&a);
        assert!(result.is_ok());
        assert_eq!(result.context.unwrap()["n"], 42);
    }

    #[test]
    fn test_execute_writes_timeout_result() {
        let dir = TempDir::new().unwrap();
        let mut a = args(&dir, "while true do end", json!({}));
        a.timeout = Duration::from_millis(100);
        execute(&a).unwrap();

        let result = read_result(&a);
        assert!(!result.is_ok());
        assert_eq!(result.failure, Some(FailureKind::ExecutionTimeout));
    }

    #[test]
    fn test_execute_missing_source_is_worker_error() {
        let dir = TempDir::new().unwrap();
        let mut a = args(&dir, "", json!({}));
        a.source = dir.path().join("missing.lua");
        assert!(matches!(execute(&a), Err(SandboxError::Io(_))));
        assert!(!a.output.exists());
    }

    #[test]
    fn test_worker_result_for_error() {
        let err = SandboxError::RuntimeFailure("bad".into());
        let result = WorkerResult::error(err.kind(), failure_message(&err), 3);
        assert_eq!(result.failure, Some(FailureKind::RuntimeFailure));
        assert_eq!(result.error.as_deref(), Some("bad"));
    }
}
