//! Human approval requests.
//!
//! An [`ApprovalBook`] holds open requests. Each entry owns a `watch`
//! channel so a waiting step wakes as soon as someone resolves it. An entry
//! leaves the book once its waiters have observed the decision or given up;
//! decisions nobody waits for are kept up to [`DECIDED_RETENTION`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        })
    }
}

/// What a step asks a human to decide.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub execution_id: Option<String>,
    pub step_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub request: ApprovalRequest,
    pub status: ApprovalStatus,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Tells approvers that a request is waiting for them.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, record: &ApprovalRecord) -> Result<()>;
}

/// Notifier that only writes a log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl ApprovalNotifier for LogNotifier {
    async fn notify(&self, record: &ApprovalRecord) -> Result<()> {
        info!(
            approval_id = %record.id,
            step_id = %record.request.step_id,
            approvers = ?record.request.approvers,
            "Approval requested: {}",
            record.request.title
        );
        Ok(())
    }
}

/// Decided requests without a waiter kept for late `get`/`wait` calls.
pub const DECIDED_RETENTION: usize = 256;

struct Entry {
    record: ApprovalRecord,
    tx: watch::Sender<ApprovalStatus>,
    /// Resolution order, zero while pending.
    decided_seq: u64,
}

/// In-memory registry of approval requests.
#[derive(Default)]
pub struct ApprovalBook {
    entries: RwLock<HashMap<String, Entry>>,
    decisions: AtomicU64,
}

impl ApprovalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new pending request.
    pub fn create(&self, request: ApprovalRequest) -> ApprovalRecord {
        let (tx, _) = watch::channel(ApprovalStatus::Pending);
        let record = ApprovalRecord {
            id: Uuid::new_v4().to_string(),
            request,
            status: ApprovalStatus::Pending,
            comments: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        self.entries.write().insert(
            record.id.clone(),
            Entry {
                record: record.clone(),
                tx,
                decided_seq: 0,
            },
        );
        record
    }

    /// Approve or reject a pending request.
    pub fn resolve(&self, id: &str, approved: bool, comments: Option<String>) -> Result<ApprovalRecord> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| PipelineError::Approval(format!("Unknown approval: {id}")))?;
        if entry.record.status != ApprovalStatus::Pending {
            return Err(PipelineError::Approval(format!(
                "Approval {id} was already {}",
                entry.record.status
            )));
        }
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        entry.record.status = status;
        entry.record.comments = comments;
        entry.record.decided_at = Some(Utc::now());
        entry.decided_seq = self.decisions.fetch_add(1, Ordering::Relaxed) + 1;
        entry.tx.send_replace(status);
        let decided = entry.record.clone();
        info!(approval_id = id, %status, "Approval resolved");
        prune_decided(&mut entries);
        Ok(decided)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<ApprovalRecord> {
        self.entries.read().get(id).map(|e| e.record.clone())
    }

    /// Pending requests, oldest first.
    pub fn list_pending(&self) -> Vec<ApprovalRecord> {
        let mut pending: Vec<ApprovalRecord> = self
            .entries
            .read()
            .values()
            .filter(|e| e.record.status == ApprovalStatus::Pending)
            .map(|e| e.record.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Wait until the request is decided. `Ok(None)` means the timeout hit
    /// first.
    ///
    /// Either way the waiter is done with the request: the last waiter to
    /// return removes it from the book.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<Option<ApprovalRecord>> {
        let mut rx = self
            .entries
            .read()
            .get(id)
            .map(|e| e.tx.subscribe())
            .ok_or_else(|| PipelineError::Approval(format!("Unknown approval: {id}")))?;

        let outcome = tokio::time::timeout(timeout, rx.wait_for(|s| *s != ApprovalStatus::Pending))
            .await
            .map(|changed| changed.is_ok());
        drop(rx);
        let record = self.release(id);

        match outcome {
            Ok(true) => Ok(record),
            Ok(false) => Err(PipelineError::Approval(format!("Approval {id} was dropped"))),
            Err(_) => {
                warn!(approval_id = id, ?timeout, "Approval timed out");
                Ok(None)
            }
        }
    }

    /// Current record, dropping the entry when no other waiter holds it.
    fn release(&self, id: &str) -> Option<ApprovalRecord> {
        let mut entries = self.entries.write();
        let entry = entries.get(id)?;
        let record = entry.record.clone();
        if entry.tx.receiver_count() == 0 {
            entries.remove(id);
        }
        Some(record)
    }
}

/// Drop the oldest decided, unwatched entries beyond [`DECIDED_RETENTION`].
fn prune_decided(entries: &mut HashMap<String, Entry>) {
    let mut decided: Vec<(u64, String)> = entries
        .iter()
        .filter(|(_, e)| e.decided_seq > 0 && e.tx.receiver_count() == 0)
        .map(|(id, e)| (e.decided_seq, id.clone()))
        .collect();
    if decided.len() <= DECIDED_RETENTION {
        return;
    }
    decided.sort();
    let excess = decided.len() - DECIDED_RETENTION;
    for (_, id) in decided.into_iter().take(excess) {
        entries.remove(&id);
    }
}

impl std::fmt::Debug for ApprovalBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalBook")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}
