//! Serve command - load workflows, fire triggers and run queued executions
//! until interrupted.
//!
//! Approval steps publish their requests into the approval inbox; decisions
//! dropped there by `foreman approve` are applied while serving.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;
use foreman_pipeline::{
    ApprovalBook, ApprovalInbox, EngineConfig, MemoryQueue, MemoryStore, ModuleGenerator, ModuleStore,
    SchedulerConfig, TriggerScheduler, WorkerPool, WorkflowEngine, WorkflowEvent, WorkflowLoader, WorkflowStore,
    default_registry,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{Context, runner_deps, sandbox_config};

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Workflow directory (defaults to paths.workflow_dir)
    #[arg(long)]
    pub workflows: Option<PathBuf>,

    /// Generated module directory (defaults to paths.module_dir)
    #[arg(long)]
    pub modules: Option<PathBuf>,

    /// Approval inbox (defaults to paths.approval_dir)
    #[arg(long)]
    pub approvals: Option<PathBuf>,

    /// Number of workers (defaults to engine.workers)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Generate modules for dynamic steps whenever a workflow loads
    #[arg(long)]
    pub generate: bool,

    /// Do not watch the workflow directory for changes
    #[arg(long)]
    pub no_watch: bool,
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let config = ctx.config();
    let paths = config.paths();
    let workflow_dir = args.workflows.unwrap_or(paths.workflow_dir);
    let module_dir = args.modules.unwrap_or(paths.module_dir);
    let approval_dir = args.approvals.unwrap_or(paths.approval_dir);
    let workers = args.workers.unwrap_or(config.engine().workers);
    let scheduler_config = SchedulerConfig::from(&config.scheduler());

    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let generator = args
        .generate
        .then(|| ModuleGenerator::new(sandbox_config(&config.sandbox()), ModuleStore::new(&module_dir)));

    let loader = WorkflowLoader::new(&workflow_dir, store.clone())?;
    for event in loader.load_all().await {
        handle_event(&event, store.as_ref(), generator.as_ref()).await;
    }

    let inbox = ApprovalInbox::open(&approval_dir, Arc::new(ApprovalBook::new()))
        .with_context(|| format!("Failed to open approval inbox {}", approval_dir.display()))?;
    let (_decision_watcher, mut decisions) =
        inbox.watch(scheduler_config.file_debounce.max(Duration::from_millis(50)))?;
    // Decisions left over from an earlier process can never match.
    inbox.apply_decisions()?;
    let deps = runner_deps(config, &module_dir)?
        .with_approvals(inbox.book().clone())
        .with_notifier(inbox.notifier());

    let engine = Arc::new(WorkflowEngine::new(
        store.clone(),
        default_registry(deps),
        EngineConfig::from(&config.engine()),
    ));
    let scheduler = Arc::new(TriggerScheduler::new(store.clone(), queue.clone(), scheduler_config));

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler_task = scheduler.clone().spawn(stop_rx.clone());
    let mut worker_set = WorkerPool::new(engine, queue.clone(), workers).spawn(stop_rx);

    let watch = if args.no_watch {
        None
    } else {
        Some(loader.watch(scheduler.config().file_debounce.max(Duration::from_millis(100)))?)
    };
    let (mut events, _watch_handle) = match watch {
        Some((events, handle)) => (Some(events), Some(handle)),
        None => (None, None),
    };

    info!(
        workflow_dir = %workflow_dir.display(),
        approval_dir = %approval_dir.display(),
        workflows = loader.len(),
        workers,
        "Foreman serving; press Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
                break;
            }
            Some(event) = next_event(&mut events) => {
                handle_event(&event, store.as_ref(), generator.as_ref()).await;
                if let Err(e) = scheduler.refresh().await {
                    warn!(error = %e, "Failed to refresh triggers");
                }
            }
            Some(_) = decisions.recv() => {
                if let Err(e) = inbox.apply_decisions() {
                    warn!(error = %e, "Failed to apply approval decisions");
                }
            }
        }
    }

    let _ = stop_tx.send(true);
    queue.close();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task panicked");
    }
    while let Some(joined) = worker_set.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task panicked");
        }
    }
    let requeued = queue.requeue_unacked();
    if requeued > 0 {
        warn!(requeued, "Requests were still in flight at shutdown");
    }
    Ok(())
}

/// Next loader event, or pending forever when not watching.
async fn next_event(
    events: &mut Option<tokio::sync::mpsc::Receiver<WorkflowEvent>>,
) -> Option<WorkflowEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_event(event: &WorkflowEvent, store: &dyn WorkflowStore, generator: Option<&ModuleGenerator>) {
    match event {
        WorkflowEvent::Loaded { id, .. } => {
            let Some(generator) = generator else {
                return;
            };
            match store.get_workflow(id).await {
                Ok(workflow) => {
                    if let Err(e) = generator.generate_for_workflow(&workflow).await {
                        error!(workflow_id = %id, error = %e, "Module generation failed");
                    }
                }
                Err(e) => warn!(workflow_id = %id, error = %e, "Loaded workflow vanished"),
            }
        }
        WorkflowEvent::Removed { id, .. } => info!(workflow_id = %id, "Workflow unloaded"),
        WorkflowEvent::Error { path, error } => {
            warn!(path = %path.display(), error = %error, "Skipping workflow file");
        }
    }
}
