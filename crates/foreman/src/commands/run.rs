//! Run command - execute a workflow file once, in-process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use clap::Args;
use foreman_pipeline::{
    ApprovalBook, ApprovalNotifier, ApprovalRecord, EngineConfig, Execution, ExecutionObserver, ExecutionStatus,
    MemoryStore, ModuleGenerator, ModuleStore, StepResult, WorkflowEngine, WorkflowStore, default_registry,
};
use serde_json::Value;
use tracing::{info, warn};

use super::{Context, load_workflow, print_json, runner_deps, sandbox_config};

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow file (.toml or .json)
    pub file: PathBuf,

    /// Execution input as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub input: String,

    /// Approve every approval step as soon as it is requested
    #[arg(long)]
    pub auto_approve: bool,

    /// Generate modules for dynamic steps before running
    #[arg(long)]
    pub generate: bool,

    /// Generated module directory (defaults to paths.module_dir)
    #[arg(long)]
    pub modules: Option<PathBuf>,
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let workflow = load_workflow(&args.file)?;
    let input: Value = serde_json::from_str(&args.input).context("--input is not valid JSON")?;
    if !input.is_object() {
        bail!("--input must be a JSON object");
    }

    let config = ctx.config();
    let module_dir = args.modules.unwrap_or_else(|| config.paths().module_dir);

    if args.generate {
        let generator = ModuleGenerator::new(sandbox_config(&config.sandbox()), ModuleStore::new(&module_dir));
        let modules = generator.generate_for_workflow(&workflow).await?;
        info!(count = modules.len(), dir = %module_dir.display(), "Generated modules");
    }

    let mut deps = runner_deps(config, &module_dir)?;
    if args.auto_approve {
        let approvals = Arc::new(ApprovalBook::new());
        deps = deps
            .with_approvals(approvals.clone())
            .with_notifier(Arc::new(AutoApprove { approvals }));
    }

    let store = Arc::new(MemoryStore::new());
    let workflow_id = workflow.id.clone();
    store.put_workflow(workflow).await?;

    let engine = WorkflowEngine::new(
        store,
        default_registry(deps),
        EngineConfig::from(&config.engine()),
    )
    .with_observer(Arc::new(StepLog));

    let execution = engine.start(&workflow_id, input).await?;
    report(&execution, ctx)?;

    if execution.status == ExecutionStatus::Failed {
        bail!(
            "Execution {} failed: {}",
            execution.id,
            execution.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn report(execution: &Execution, ctx: &Context) -> Result<()> {
    if ctx.json_output || ctx.verbose {
        return print_json(execution);
    }
    // Compact form: status line plus the per-step map.
    println!("{} {} ({})", execution.workflow_id, execution.status, execution.id);
    if let Some(result) = &execution.result {
        print_json(result)?;
    }
    Ok(())
}

/// Logs each finished step.
struct StepLog;

impl ExecutionObserver for StepLog {
    fn step_finished(&self, execution_id: &str, step_id: &str, result: &StepResult) {
        if result.success {
            info!(execution_id, step_id, status = ?result.status, duration_ms = result.duration.as_millis() as u64, "Step finished");
        } else {
            warn!(execution_id, step_id, error = result.error.as_deref().unwrap_or(""), "Step failed");
        }
    }
}

/// Resolves approvals as approved the moment they are requested.
struct AutoApprove {
    approvals: Arc<ApprovalBook>,
}

#[async_trait]
impl ApprovalNotifier for AutoApprove {
    async fn notify(&self, record: &ApprovalRecord) -> foreman_pipeline::Result<()> {
        info!(approval_id = %record.id, title = %record.request.title, "Auto-approving");
        self.approvals
            .resolve(&record.id, true, Some("auto-approved".to_string()))
            .map(|_| ())
    }
}
