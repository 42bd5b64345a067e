//! Hidden `sandbox-exec` entry point run by the out-of-process sandbox.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use foreman_sandbox::{WorkerArgs, run_worker};

#[derive(Args, Debug)]
pub struct SandboxExecArgs {
    #[arg(long)]
    pub source: PathBuf,

    #[arg(long)]
    pub context: PathBuf,

    #[arg(long)]
    pub output: PathBuf,

    #[arg(long)]
    pub timeout_ms: u64,

    #[arg(long)]
    pub memory_bytes: usize,

    #[arg(long)]
    pub cpu_secs: u64,

    #[arg(long = "allow-module")]
    pub allow_module: Vec<String>,
}

pub fn run(args: SandboxExecArgs) -> Result<()> {
    let worker = WorkerArgs {
        source: args.source,
        context: args.context,
        output: args.output,
        timeout: Duration::from_millis(args.timeout_ms),
        memory_bytes: args.memory_bytes,
        cpu_secs: args.cpu_secs,
        allowed_modules: args.allow_module,
    };
    run_worker(&worker)?;
    Ok(())
}
