//! Execution request queue.
//!
//! Delivery is at-least-once: a dequeued request stays in flight until it is
//! acked, and [`MemoryQueue::requeue_unacked`] puts anything still in flight
//! back at the front of the queue (e.g. after a worker crash).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// A request to run a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub workflow_id: String,
    /// Run an already-created execution instead of creating a new one.
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    /// Why the request was made (`cron`, `file_watch:<path>`, `manual`, ...).
    #[serde(default)]
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            execution_id: None,
            input: Value::Object(serde_json::Map::new()),
            reason: "manual".to_string(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

/// A dequeued request awaiting its ack.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub request: ExecutionRequest,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
}

/// Queue contract used by triggers (producers) and workers (consumers).
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, request: ExecutionRequest) -> Result<()>;

    /// Wait for the next request. `Ok(None)` means the queue was closed and
    /// drained.
    async fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Confirm a delivery was handled.
    async fn ack(&self, tag: u64) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(ExecutionRequest, u32)>,
    in_flight: HashMap<u64, (ExecutionRequest, u32)>,
}

/// In-process [`TaskQueue`].
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting requests and wake every waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        info!("Task queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Put every unacked delivery back at the front of the queue.
    pub fn requeue_unacked(&self) -> usize {
        let mut state = self.state.lock();
        let mut pending: Vec<(u64, (ExecutionRequest, u32))> = state.in_flight.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        let count = pending.len();
        for (_, entry) in pending.into_iter().rev() {
            state.ready.push_front(entry);
        }
        drop(state);
        for _ in 0..count {
            self.notify.notify_one();
        }
        if count > 0 {
            info!(count, "Requeued unacked deliveries");
        }
        count
    }

    /// Requests waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliveries not yet acked.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn try_take(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        let (request, previous) = state.ready.pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let attempt = previous + 1;
        state.in_flight.insert(tag, (request.clone(), attempt));
        Some(Delivery {
            tag,
            request,
            attempt,
        })
    }
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("ready", &self.len())
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, request: ExecutionRequest) -> Result<()> {
        if self.is_closed() {
            return Err(PipelineError::Queue("queue is closed".to_string()));
        }
        debug!(
            request_id = %request.request_id,
            workflow_id = %request.workflow_id,
            reason = %request.reason,
            "Enqueued execution request"
        );
        self.state.lock().ready.push_back((request, 0));
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        loop {
            // Register interest before checking so a concurrent enqueue or
            // close cannot slip between the check and the wait.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }
            if self.is_closed() {
                return Ok(None);
            }
            notified.await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        match self.state.lock().in_flight.remove(&tag) {
            Some(_) => Ok(()),
            None => Err(PipelineError::Queue(format!("Unknown delivery tag {tag}"))),
        }
    }
}
