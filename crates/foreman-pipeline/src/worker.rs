//! Queue workers.
//!
//! Each worker loops `dequeue → engine → ack`. Errors from one execution
//! are logged and swallowed so a bad request never takes a worker down.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::WorkflowEngine;
use crate::error::{PipelineError, Result};
use crate::queue::{Delivery, ExecutionRequest, TaskQueue};
use crate::store::Execution;

/// A fixed number of workers sharing one engine and one queue.
pub struct WorkerPool {
    engine: Arc<WorkflowEngine>,
    queue: Arc<dyn TaskQueue>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(engine: Arc<WorkflowEngine>, queue: Arc<dyn TaskQueue>, workers: usize) -> Self {
        Self {
            engine,
            queue,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start the workers. They exit when `stop` flips to `true` or the queue
    /// is closed and drained.
    pub fn spawn(&self, stop: watch::Receiver<bool>) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for worker in 0..self.workers {
            let engine = Arc::clone(&self.engine);
            let queue = Arc::clone(&self.queue);
            let mut stop = stop.clone();
            set.spawn(async move {
                info!(worker, "Worker started");
                loop {
                    if *stop.borrow() {
                        break;
                    }
                    let delivery = tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                            continue;
                        }
                        next = queue.dequeue() => next,
                    };
                    match delivery {
                        Ok(Some(delivery)) => handle(&engine, queue.as_ref(), worker, delivery).await,
                        Ok(None) => break,
                        Err(e) => error!(worker, error = %e, "Dequeue failed"),
                    }
                }
                info!(worker, "Worker stopped");
            });
        }
        set
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.workers).finish()
    }
}

async fn handle(engine: &WorkflowEngine, queue: &dyn TaskQueue, worker: usize, delivery: Delivery) {
    debug!(
        worker,
        request_id = %delivery.request.request_id,
        attempt = delivery.attempt,
        "Processing request"
    );
    match process_request(engine, &delivery.request).await {
        Ok(execution) => info!(
            worker,
            workflow_id = %execution.workflow_id,
            execution_id = %execution.id,
            status = %execution.status,
            "Request processed"
        ),
        Err(PipelineError::AlreadyFinished(id)) => {
            debug!(worker, execution_id = %id, "Redelivered request for finished execution");
        }
        Err(e) => warn!(
            worker,
            request_id = %delivery.request.request_id,
            workflow_id = %delivery.request.workflow_id,
            error = %e,
            "Request failed"
        ),
    }
    if let Err(e) = queue.ack(delivery.tag).await {
        error!(worker, tag = delivery.tag, error = %e, "Ack failed");
    }
}

/// Run one request: resume the named execution, or start a new one.
pub async fn process_request(engine: &WorkflowEngine, request: &ExecutionRequest) -> Result<Execution> {
    match &request.execution_id {
        Some(id) => engine.run_execution(id, request.input.clone()).await,
        None => engine.start(&request.workflow_id, request.input.clone()).await,
    }
}
