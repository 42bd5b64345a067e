//! Validation and isolated execution of generated step logic.
//!
//! Generated code is untrusted Lua. Every execution passes three gates:
//!
//! 1. **Static validation** ([`Validator`]): denied libraries and functions,
//!    disallowed `require`s, introspection names, size and line ceilings,
//!    regex backstops. All violations are reported together and the code is
//!    never run.
//! 2. **Isolated execution** in one of two modes ([`ExecutionMode`]):
//!    - in-process, on a blocking thread, in a fresh restricted interpreter
//!      with a memory ceiling and an instruction-hook deadline;
//!    - out-of-process, in a `sandbox-exec` worker that applies address-space
//!      and CPU-time rlimits to itself and is killed by the parent when its
//!      budget runs out.
//! 3. **Normalization** into a [`SandboxReport`].
//!
//! Generated code reaches the host only through the [`Capabilities`] object
//! (`foreman.log`, `foreman.now`, `foreman.json`, and `foreman.dispatch` when
//! a [`StepDispatcher`] is supplied).
//!
//! # Example
//!
//! ```no_run
//! use foreman_sandbox::{ExecutionMode, SandboxConfig, SandboxExecutor};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor =
//!         SandboxExecutor::new(SandboxConfig::default().with_mode(ExecutionMode::InProcess));
//!     let report = executor
//!         .execute("context.total = context.a + context.b", &json!({"a": 1, "b": 2}), None)
//!         .await;
//!     assert!(report.success);
//! }
//! ```

mod capabilities;
mod config;
mod error;
mod executor;
mod protocol;
mod runtime;
mod subprocess;
mod validator;
mod worker;

pub use capabilities::{
    Capabilities, DispatchFn, DispatchRequest, StepDispatcher, dispatch_unavailable,
};
pub use config::{ExecutionMode, SandboxConfig};
pub use error::{FailureKind, SandboxError, SandboxResult};
pub use executor::{SandboxExecutor, SandboxReport};
pub use protocol::{DispatchReply, WorkerMessage, WorkerResult};
pub use runtime::{RuntimeLimits, run_chunk};
pub use validator::{Validator, Violation};
pub use worker::{WorkerArgs, run_worker};
