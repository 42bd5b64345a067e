//! Workflow engine: runs one execution from start to finish.
//!
//! The engine loads a workflow, validates it, asks the graph for an order
//! and then walks that order one step at a time:
//!
//! ```text
//! pending ──validate──► running ──steps in topological order──► completed | failed
//! ```
//!
//! Each step sees only the execution input and the outputs of its
//! transitive ancestors. Runner failures halt the walk unless the step (or
//! the engine default) opts into continuing, in which case every dependent
//! of the failed step is marked skipped and independent steps still run.
//! Edges leaving a step whose result names a branch (a `condition` step,
//! say) only carry to that target; a step reachable only through untaken
//! edges is skipped as well.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use foreman_config::EngineSection;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::context::ExecutionContext;
use crate::definition::{NodeDefinition, Workflow};
use crate::error::{PipelineError, Result};
use crate::graph::ExecutionGraph;
use crate::runner::{RunnerRegistry, StepResult, StepStatus};
use crate::store::{Execution, ExecutionStatus, WorkflowStore};

/// Engine-wide policy.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Failure policy for steps that don't set `continue_on_failure`.
    pub continue_on_failure: bool,
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            continue_on_failure: section.continue_on_failure,
        }
    }
}

/// Fire-and-forget hooks for execution and step events.
///
/// Every method defaults to a no-op. Implementations must not block.
pub trait ExecutionObserver: Send + Sync {
    fn execution_started(&self, _execution: &Execution) {}

    fn step_finished(&self, _execution_id: &str, _step_id: &str, _result: &StepResult) {}

    fn execution_finished(&self, _execution: &Execution) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// Why a step was not run.
enum Blocked {
    /// An ancestor failed.
    Upstream(String),
    /// Every incoming edge was pruned by a condition.
    NotTaken,
}

/// Runs workflow executions against a store and a runner registry.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<RunnerRegistry>,
    config: EngineConfig,
    observer: Arc<dyn ExecutionObserver>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, registry: Arc<RunnerRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    /// Create a pending execution of `workflow_id` and run it.
    pub async fn start(&self, workflow_id: &str, input: Value) -> Result<Execution> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let execution = self.store.create_execution(workflow_id).await?;
        info!(
            workflow_id,
            execution_id = %execution.id,
            "Created execution"
        );
        self.run(&workflow, execution, input).await
    }

    /// Run an execution that was created earlier.
    ///
    /// A finished execution is never re-run: this returns `AlreadyFinished`.
    /// An execution another worker is running returns `InvalidTransition`.
    pub async fn run_execution(&self, execution_id: &str, input: Value) -> Result<Execution> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(PipelineError::AlreadyFinished(execution_id.to_string()));
        }
        if execution.status == ExecutionStatus::Running {
            return Err(PipelineError::InvalidTransition {
                id: execution_id.to_string(),
                from: ExecutionStatus::Running.to_string(),
                to: ExecutionStatus::Running.to_string(),
            });
        }
        let workflow = self.store.get_workflow(&execution.workflow_id).await?;
        self.run(&workflow, execution, input).await
    }

    async fn run(&self, workflow: &Workflow, execution: Execution, input: Value) -> Result<Execution> {
        let (graph, order) = match self.prepare(workflow) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(
                    workflow_id = %workflow.id,
                    execution_id = %execution.id,
                    error = %e,
                    "Workflow rejected before running"
                );
                self.fail_execution(&execution.id, &e, None).await;
                return Err(e);
            }
        };

        let running = match self
            .store
            .update_execution_status(&execution.id, ExecutionStatus::Running, None, None)
            .await
        {
            Ok(running) => running,
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "Failed to start execution");
                self.fail_execution(&execution.id, &e, None).await;
                return Err(e);
            }
        };
        self.observer.execution_started(&running);
        info!(
            workflow_id = %workflow.id,
            execution_id = %running.id,
            steps = order.len(),
            "Execution started"
        );

        let started = Instant::now();
        let ctx = ExecutionContext::new(&workflow.id, &running.id).with_input(input);
        let walk = self.walk(workflow, &graph, &order, ctx).await;
        let result = walk.to_json(&workflow.id, &order, started.elapsed());

        let (status, error) = match &walk.halted {
            Some(reason) => (ExecutionStatus::Failed, Some(reason.clone())),
            None => (ExecutionStatus::Completed, None),
        };

        let finished = match self
            .store
            .update_execution_status(&running.id, status, error, Some(result.clone()))
            .await
        {
            Ok(finished) => finished,
            Err(e) => {
                error!(execution_id = %running.id, error = %e, "Failed to persist execution result");
                self.fail_execution(&running.id, &e, Some(result)).await;
                return Err(e);
            }
        };

        info!(
            workflow_id = %workflow.id,
            execution_id = %finished.id,
            status = %finished.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Execution finished"
        );
        self.observer.execution_finished(&finished);
        Ok(finished)
    }

    /// Record `cause` as the reason the execution failed.
    ///
    /// Transition errors mean someone else owns the record, so it is left
    /// alone. A failure to write the Failed status is logged, not returned:
    /// the caller is already propagating `cause`.
    async fn fail_execution(&self, execution_id: &str, cause: &PipelineError, result: Option<Value>) {
        if matches!(
            cause,
            PipelineError::InvalidTransition { .. } | PipelineError::AlreadyFinished(_)
        ) {
            return;
        }
        match self
            .store
            .update_execution_status(execution_id, ExecutionStatus::Failed, Some(cause.to_string()), result)
            .await
        {
            Ok(failed) => self.observer.execution_finished(&failed),
            Err(e) => error!(
                execution_id,
                cause = %cause,
                error = %e,
                "Failed to mark execution as failed"
            ),
        }
    }

    /// Validate the workflow and resolve its order. Nothing runs if this fails.
    fn prepare(&self, workflow: &Workflow) -> Result<(ExecutionGraph, Vec<String>)> {
        workflow.validate()?;
        for node in workflow.resolved_nodes() {
            if !self.registry.contains(&node.step_type) {
                return Err(PipelineError::UnknownStepType(node.step_type));
            }
        }
        let graph = ExecutionGraph::build(workflow)?;
        let order = graph.topological_order()?;
        Ok((graph, order))
    }

    async fn walk(
        &self,
        workflow: &Workflow,
        graph: &ExecutionGraph,
        order: &[String],
        mut ctx: ExecutionContext,
    ) -> Walk {
        let nodes: HashMap<String, NodeDefinition> = workflow
            .resolved_nodes()
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let mut walk = Walk::default();

        for id in order {
            if walk.halted.is_some() {
                break;
            }
            let Some(node) = nodes.get(id) else {
                continue;
            };

            let result = match walk.blocked(graph, id) {
                Some(blocked) => {
                    let reason = match blocked {
                        Blocked::Upstream(failed) => {
                            walk.upstream_failed.insert(id.clone());
                            format!("upstream step '{failed}' failed")
                        }
                        Blocked::NotTaken => "branch not taken".to_string(),
                    };
                    debug!(execution_id = %ctx.execution_id(), step_id = %id, reason = %reason, "Skipping step");
                    StepResult::skipped(reason)
                }
                None => self.run_step(graph, node, &ctx).await,
            };

            if let Some(output) = result.output() {
                if let Some(target) = &result.branch {
                    walk.selected.insert(id.clone(), target.clone());
                }
                ctx.record_output(id, output);
            }

            if result.status == StepStatus::Failed {
                let error = result.error.clone().unwrap_or_default();
                let tolerate = node
                    .continue_on_failure()
                    .unwrap_or(self.config.continue_on_failure);
                if tolerate {
                    warn!(execution_id = %ctx.execution_id(), step_id = %id, error = %error, "Step failed, continuing");
                } else {
                    warn!(execution_id = %ctx.execution_id(), step_id = %id, error = %error, "Step failed, halting");
                    walk.halted = Some(format!("Step '{id}' failed: {error}"));
                }
            }

            self.observer.step_finished(ctx.execution_id(), id, &result);
            walk.record(id, result);
        }
        walk
    }

    async fn run_step(&self, graph: &ExecutionGraph, node: &NodeDefinition, ctx: &ExecutionContext) -> StepResult {
        let runner = match self.registry.create(&node.step_type) {
            Ok(runner) => runner,
            Err(e) => return StepResult::failed(e.to_string()),
        };
        let visible = ctx.visible_to(&graph.ancestors(&node.id));
        debug!(
            execution_id = %ctx.execution_id(),
            step_id = %node.id,
            step_type = %node.step_type,
            "Running step"
        );

        let started = Instant::now();
        let mut result = runner.execute(&node.id, &node.params(), &visible).await;
        if result.duration.is_zero() {
            result.duration = started.elapsed();
        }
        debug!(
            execution_id = %ctx.execution_id(),
            step_id = %node.id,
            status = %result.status,
            duration_ms = result.duration.as_millis() as u64,
            "Step finished"
        );
        result
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Walk state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Walk {
    steps: Map<String, Value>,
    statuses: HashMap<String, StepStatus>,
    /// Branching step → the target it selected.
    selected: HashMap<String, String>,
    /// Steps skipped because an ancestor failed.
    upstream_failed: HashSet<String>,
    halted: Option<String>,
}

impl Walk {
    fn blocked(&self, graph: &ExecutionGraph, id: &str) -> Option<Blocked> {
        let predecessors = graph.predecessors(id);
        if predecessors.is_empty() {
            return None;
        }

        let mut live = 0;
        for pred in &predecessors {
            match self.statuses.get(pred) {
                Some(StepStatus::Failed) => return Some(Blocked::Upstream(pred.clone())),
                Some(StepStatus::Skipped) if self.upstream_failed.contains(pred) => {
                    return Some(Blocked::Upstream(pred.clone()));
                }
                Some(StepStatus::Skipped) => {}
                _ => match self.selected.get(pred) {
                    Some(target) if target != id => {}
                    _ => live += 1,
                },
            }
        }
        (live == 0).then_some(Blocked::NotTaken)
    }

    fn record(&mut self, id: &str, result: StepResult) {
        self.statuses.insert(id.to_string(), result.status);
        self.steps.insert(id.to_string(), result.to_json());
    }

    fn count(&self, status: StepStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    fn to_json(&self, workflow_id: &str, order: &[String], elapsed: Duration) -> Value {
        json!({
            "steps": self.steps,
            "order": order,
            "metadata": {
                "workflow_id": workflow_id,
                "completed_steps": self.count(StepStatus::Completed),
                "failed_steps": self.count(StepStatus::Failed),
                "skipped_steps": self.count(StepStatus::Skipped),
                "pending_steps": self.count(StepStatus::Pending),
                "duration_ms": elapsed.as_millis() as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::StepRunner;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Echoes the resolved `value` param; fails when `fail` is true.
    struct Echo;

    #[async_trait]
    impl StepRunner for Echo {
        fn step_type(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult {
            let params = ctx.interpolate(params);
            if params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                return StepResult::failed("echo failed");
            }
            StepResult::completed(json!({"value": params.get("value").cloned().unwrap_or(Value::Null)}))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ExecutionObserver for Recorder {
        fn execution_started(&self, _execution: &Execution) {
            self.events.lock().push("started".into());
        }

        fn step_finished(&self, _execution_id: &str, step_id: &str, result: &StepResult) {
            self.events.lock().push(format!("{step_id}:{}", result.status));
        }

        fn execution_finished(&self, execution: &Execution) {
            self.events.lock().push(format!("finished:{}", execution.status));
        }
    }

    fn registry() -> Arc<RunnerRegistry> {
        Arc::new(
            RunnerRegistry::builder()
                .register_runner(Arc::new(Echo))
                .register_runner(Arc::new(crate::runner::ConditionRunner))
                .build(),
        )
    }

    async fn engine_with(workflow: Workflow, config: EngineConfig) -> (WorkflowEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.put_workflow(workflow).await.unwrap();
        let engine = WorkflowEngine::new(store.clone(), registry(), config);
        (engine, store)
    }

    #[tokio::test]
    async fn test_values_flow_between_steps() {
        let wf = Workflow::new("wf", "Flow")
            .with_node("a", "echo", json!({"value": "${name}"}))
            .with_node("b", "echo", json!({"value": "got ${a.value}"}))
            .with_edge("a", "b");
        let (engine, _) = engine_with(wf, EngineConfig::default()).await;

        let exec = engine.start("wf", json!({"name": "ada"})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let result = exec.result.unwrap();
        assert_eq!(result["steps"]["b"]["result"]["value"], "got ada");
        assert_eq!(result["order"], json!(["a", "b"]));
        assert_eq!(result["metadata"]["completed_steps"], 2);
    }

    #[tokio::test]
    async fn test_observer_sees_every_step() {
        let wf = Workflow::new("wf", "Observed")
            .with_node("a", "echo", json!({}))
            .with_node("b", "echo", json!({"fail": true}))
            .with_node("c", "echo", json!({}))
            .with_edge("a", "b")
            .with_edge("b", "c");
        let (engine, _) = engine_with(wf, EngineConfig::default()).await;
        let recorder = Arc::new(Recorder::default());
        let engine = engine.with_observer(recorder.clone());

        engine.start("wf", json!({})).await.unwrap();
        assert_eq!(
            *recorder.events.lock(),
            vec!["started", "a:completed", "b:failed", "finished:failed"]
        );
    }

    #[tokio::test]
    async fn test_engine_default_can_continue() {
        let wf = Workflow::new("wf", "Lenient")
            .with_node("a", "echo", json!({"fail": true}))
            .with_node("b", "echo", json!({}));
        let (engine, _) = engine_with(
            wf,
            EngineConfig {
                continue_on_failure: true,
            },
        )
        .await;

        let exec = engine.start("wf", json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let meta = &exec.result.unwrap()["metadata"];
        assert_eq!(meta["failed_steps"], 1);
        assert_eq!(meta["completed_steps"], 1);
    }

    #[tokio::test]
    async fn test_node_override_beats_engine_default() {
        let wf = Workflow::new("wf", "Strict")
            .with_node("a", "echo", json!({"fail": true, "continue_on_failure": false}))
            .with_node("b", "echo", json!({}));
        let (engine, _) = engine_with(
            wf,
            EngineConfig {
                continue_on_failure: true,
            },
        )
        .await;

        let exec = engine.start("wf", json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("Step 'a' failed: echo failed"));
        assert!(exec.result.unwrap()["steps"].get("b").is_none());
    }

    #[tokio::test]
    async fn test_unknown_step_type_fails_before_running() {
        let wf = Workflow::new("wf", "Unknown").with_node("a", "teleport", json!({}));
        let (engine, store) = engine_with(wf, EngineConfig::default()).await;

        let err = engine.start("wf", json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStepType(ref t) if t == "teleport"));
        let exec = &store.executions_for("wf")[0];
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.started_at.is_none());
    }

    #[tokio::test]
    async fn test_cycle_fails_before_running() {
        let wf = Workflow::new("wf", "Loop")
            .with_node("a", "echo", json!({}))
            .with_node("b", "echo", json!({}))
            .with_edge("a", "b")
            .with_edge("b", "a");
        let (engine, store) = engine_with(wf, EngineConfig::default()).await;

        let err = engine.start("wf", json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::CycleDetected { .. }));
        let exec = &store.executions_for("wf")[0];
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.as_deref().unwrap().contains("Cycle detected"));
    }

    #[tokio::test]
    async fn test_missing_workflow() {
        let store = Arc::new(MemoryStore::new());
        let engine = WorkflowEngine::new(store, registry(), EngineConfig::default());
        assert!(matches!(
            engine.start("ghost", json!({})).await,
            Err(PipelineError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_untaken_branch_is_skipped() {
        let wf = Workflow::new("wf", "Branch")
            .with_node(
                "route",
                "condition",
                json!({"conditions": [{"expression": "${n} > 10", "target": "big"}], "default": "small"}),
            )
            .with_node("big", "echo", json!({"value": "big"}))
            .with_node("small", "echo", json!({"value": "small"}))
            .with_node("after_big", "echo", json!({}))
            .with_edge("route", "big")
            .with_edge("route", "small")
            .with_edge("big", "after_big");
        let (engine, _) = engine_with(wf, EngineConfig::default()).await;

        let exec = engine.start("wf", json!({"n": 3})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let steps = &exec.result.unwrap()["steps"];
        assert_eq!(steps["small"]["status"], "completed");
        assert_eq!(steps["big"]["status"], "skipped");
        assert_eq!(steps["big"]["error"], "branch not taken");
        assert_eq!(steps["after_big"]["status"], "skipped");
    }

    /// Routes to whatever `to` names, without being a condition step.
    struct Router;

    #[async_trait]
    impl StepRunner for Router {
        fn step_type(&self) -> &str {
            "router"
        }

        async fn execute(&self, _step_id: &str, params: &Value, _ctx: &ExecutionContext) -> StepResult {
            let to = params.get("to").and_then(Value::as_str).unwrap_or_default();
            StepResult::completed(json!({"picked": to})).with_branch(to)
        }
    }

    #[tokio::test]
    async fn test_any_runner_can_select_a_branch() {
        let wf = Workflow::new("wf", "Routed")
            .with_node("route", "router", json!({"to": "left"}))
            .with_node("left", "echo", json!({"value": "l"}))
            .with_node("right", "echo", json!({"value": "r"}))
            .with_edge("route", "left")
            .with_edge("route", "right");
        let store = Arc::new(MemoryStore::new());
        store.put_workflow(wf).await.unwrap();
        let registry = Arc::new(
            RunnerRegistry::builder()
                .register_runner(Arc::new(Echo))
                .register_runner(Arc::new(Router))
                .build(),
        );
        let engine = WorkflowEngine::new(store, registry, EngineConfig::default());

        let exec = engine.start("wf", json!({})).await.unwrap();
        let steps = &exec.result.unwrap()["steps"];
        assert_eq!(steps["left"]["status"], "completed");
        assert_eq!(steps["right"]["status"], "skipped");
        assert_eq!(steps["right"]["error"], "branch not taken");
    }

    /// Delegates to a [`MemoryStore`] but refuses chosen status writes.
    struct FlakyStore {
        inner: MemoryStore,
        refuse: Vec<ExecutionStatus>,
    }

    #[async_trait]
    impl WorkflowStore for FlakyStore {
        async fn get_workflow(&self, id: &str) -> Result<Workflow> {
            self.inner.get_workflow(id).await
        }

        async fn put_workflow(&self, workflow: Workflow) -> Result<()> {
            self.inner.put_workflow(workflow).await
        }

        async fn remove_workflow(&self, id: &str) -> Result<bool> {
            self.inner.remove_workflow(id).await
        }

        async fn list_workflows(&self) -> Result<Vec<Workflow>> {
            self.inner.list_workflows().await
        }

        async fn create_execution(&self, workflow_id: &str) -> Result<Execution> {
            self.inner.create_execution(workflow_id).await
        }

        async fn update_execution_status(
            &self,
            id: &str,
            status: ExecutionStatus,
            error: Option<String>,
            result: Option<Value>,
        ) -> Result<Execution> {
            if self.refuse.contains(&status) {
                return Err(PipelineError::Store(format!("disk full writing {status}")));
            }
            self.inner.update_execution_status(id, status, error, result).await
        }

        async fn get_execution(&self, id: &str) -> Result<Execution> {
            self.inner.get_execution(id).await
        }
    }

    async fn flaky_engine(refuse: Vec<ExecutionStatus>) -> (WorkflowEngine, Arc<FlakyStore>, Arc<Recorder>) {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            refuse,
        });
        store
            .put_workflow(Workflow::new("wf", "Flaky").with_node("a", "echo", json!({"value": 1})))
            .await
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let engine =
            WorkflowEngine::new(store.clone(), registry(), EngineConfig::default()).with_observer(recorder.clone());
        (engine, store, recorder)
    }

    #[tokio::test]
    async fn test_start_failure_marks_execution_failed() {
        let (engine, store, recorder) = flaky_engine(vec![ExecutionStatus::Running]).await;

        let err = engine.start("wf", json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(ref m) if m.contains("running")));

        let exec = &store.inner.executions_for("wf")[0];
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.as_deref().unwrap().contains("disk full"));
        assert!(exec.started_at.is_none());
        assert_eq!(*recorder.events.lock(), vec!["finished:failed"]);
    }

    #[tokio::test]
    async fn test_result_write_failure_marks_execution_failed() {
        let (engine, store, _) = flaky_engine(vec![ExecutionStatus::Completed]).await;

        let err = engine.start("wf", json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));

        let exec = &store.inner.executions_for("wf")[0];
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.result.as_ref().unwrap()["steps"]["a"]["status"], "completed");
    }

    #[tokio::test]
    async fn test_unrecordable_failure_still_surfaces() {
        let (engine, store, recorder) =
            flaky_engine(vec![ExecutionStatus::Running, ExecutionStatus::Failed]).await;

        let err = engine.start("wf", json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(ref m) if m.contains("running")));
        assert_eq!(store.inner.executions_for("wf")[0].status, ExecutionStatus::Pending);
        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_lost_start_race_leaves_record_alone() {
        let (engine, store) = engine_with(
            Workflow::new("wf", "Raced").with_node("a", "echo", json!({})),
            EngineConfig::default(),
        )
        .await;
        let exec = store.create_execution("wf").await.unwrap();
        store
            .update_execution_status(&exec.id, ExecutionStatus::Running, None, None)
            .await
            .unwrap();

        let err = engine.run_execution(&exec.id, json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert_eq!(store.get_execution(&exec.id).await.unwrap().status, ExecutionStatus::Running);
    }

    #[test]
    fn test_config_from_section() {
        let section = EngineSection {
            continue_on_failure: true,
            ..Default::default()
        };
        assert!(EngineConfig::from(&section).continue_on_failure);
        assert!(!EngineConfig::default().continue_on_failure);
    }
}
