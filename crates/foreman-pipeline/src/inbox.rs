//! File-based approval inbox.
//!
//! Lets a process other than the one running workflows decide approvals.
//! The serving process publishes each open request and watches for decision
//! files dropped next to them:
//!
//! ```text
//! <approval_dir>/
//! ├── pending/<id>.json     ApprovalRecord, written on request
//! └── decisions/<id>.json   Decision, written by `foreman approve`
//! ```
//!
//! A decision is applied to the [`ApprovalBook`] and then both files are
//! removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalBook, ApprovalNotifier, ApprovalRecord, ApprovalStatus};
use crate::error::{PipelineError, Result};
use crate::watch::{PathWatcher, watch_path};

const PENDING_DIR: &str = "pending";
const DECISIONS_DIR: &str = "decisions";

/// A human's answer to one approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    #[serde(default)]
    pub comments: Option<String>,
}

/// Where each kind of inbox file lives.
#[derive(Debug, Clone)]
pub struct InboxPaths {
    root: PathBuf,
}

impl InboxPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join(PENDING_DIR)
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.root.join(DECISIONS_DIR)
    }

    fn pending_file(&self, id: &str) -> Result<PathBuf> {
        Ok(self.pending_dir().join(file_name(id)?))
    }

    fn decision_file(&self, id: &str) -> Result<PathBuf> {
        Ok(self.decisions_dir().join(file_name(id)?))
    }

    /// Create both directories.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.pending_dir())?;
        std::fs::create_dir_all(self.decisions_dir())?;
        Ok(())
    }

    /// Requests currently published as pending, oldest first.
    pub fn list_pending(&self) -> Result<Vec<ApprovalRecord>> {
        let mut records = Vec::new();
        for path in json_files(&self.pending_dir())? {
            match read_json::<ApprovalRecord>(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable approval file"),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Drop a decision for the serving process to pick up.
    ///
    /// The file is written under a temporary name and renamed into place so
    /// the watcher never reads a partial decision.
    pub fn submit(&self, id: &str, decision: &Decision) -> Result<PathBuf> {
        let target = self.decision_file(id)?;
        std::fs::create_dir_all(self.decisions_dir())?;
        let staging = target.with_extension("json.tmp");
        std::fs::write(&staging, to_json(decision)?)?;
        std::fs::rename(&staging, &target)?;
        debug!(approval_id = id, path = %target.display(), "Decision submitted");
        Ok(target)
    }
}

/// Approval ids become file names, so only uuid-shaped ids are accepted.
fn file_name(id: &str) -> Result<String> {
    let valid = !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(PipelineError::Approval(format!("Invalid approval id: {id:?}")));
    }
    Ok(format!("{id}.json"))
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| PipelineError::Approval(format!("Malformed {}: {e}", path.display())))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| PipelineError::Approval(e.to_string()))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove approval file");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serving side
// ─────────────────────────────────────────────────────────────────────────────

/// Connects an [`ApprovalBook`] to an inbox directory.
#[derive(Debug, Clone)]
pub struct ApprovalInbox {
    paths: InboxPaths,
    book: Arc<ApprovalBook>,
}

impl ApprovalInbox {
    /// Open the inbox at `root`, creating it if needed.
    pub fn open(root: impl Into<PathBuf>, book: Arc<ApprovalBook>) -> Result<Self> {
        let paths = InboxPaths::new(root);
        paths.ensure()?;
        Ok(Self { paths, book })
    }

    pub fn paths(&self) -> &InboxPaths {
        &self.paths
    }

    pub fn book(&self) -> &Arc<ApprovalBook> {
        &self.book
    }

    /// Notifier that publishes each request into `pending/`.
    pub fn notifier(&self) -> Arc<dyn ApprovalNotifier> {
        Arc::new(InboxNotifier {
            paths: self.paths.clone(),
        })
    }

    /// Apply every decision file present, returning how many resolved a
    /// request.
    ///
    /// Decisions for unknown or already decided requests are discarded with
    /// a warning. Pending files whose request has left the book are removed.
    pub fn apply_decisions(&self) -> Result<usize> {
        let mut applied = 0;
        for path in json_files(&self.paths.decisions_dir())? {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match read_json::<Decision>(&path) {
                Ok(decision) => match self.book.resolve(&id, decision.approved, decision.comments) {
                    Ok(record) => {
                        info!(approval_id = %id, status = %record.status, "Applied approval decision");
                        applied += 1;
                    }
                    Err(e) => warn!(approval_id = %id, error = %e, "Discarding approval decision"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Discarding malformed approval decision"),
            }
            remove_quietly(&path);
            if let Ok(pending) = self.paths.pending_file(&id) {
                remove_quietly(&pending);
            }
        }
        self.prune_pending()?;
        Ok(applied)
    }

    /// Remove published requests that are no longer open.
    fn prune_pending(&self) -> Result<()> {
        for path in json_files(&self.paths.pending_dir())? {
            let open = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|id| self.book.get(id))
                .is_some_and(|r| r.status == ApprovalStatus::Pending);
            if !open {
                remove_quietly(&path);
            }
        }
        Ok(())
    }

    /// Watch `decisions/` for new files.
    pub fn watch(&self, debounce: Duration) -> Result<(PathWatcher, mpsc::UnboundedReceiver<Vec<PathBuf>>)> {
        watch_path(&self.paths.decisions_dir(), false, debounce)
    }
}

/// Writes each new request to `pending/<id>.json` and logs it.
struct InboxNotifier {
    paths: InboxPaths,
}

#[async_trait]
impl ApprovalNotifier for InboxNotifier {
    async fn notify(&self, record: &ApprovalRecord) -> Result<()> {
        let path = self.paths.pending_file(&record.id)?;
        std::fs::create_dir_all(self.paths.pending_dir())?;
        std::fs::write(&path, to_json(record)?)?;
        info!(
            approval_id = %record.id,
            step_id = %record.request.step_id,
            path = %path.display(),
            "Approval requested: {}",
            record.request.title
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalRequest;

    fn request(step: &str) -> ApprovalRequest {
        ApprovalRequest {
            step_id: step.to_string(),
            title: format!("Approve {step}"),
            ..Default::default()
        }
    }

    fn inbox() -> (tempfile::TempDir, ApprovalInbox) {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ApprovalInbox::open(dir.path().join("approvals"), Arc::new(ApprovalBook::new())).unwrap();
        (dir, inbox)
    }

    #[tokio::test]
    async fn test_notifier_publishes_pending_request() {
        let (_dir, inbox) = inbox();
        let record = inbox.book().create(request("deploy"));
        inbox.notifier().notify(&record).await.unwrap();

        let listed = inbox.paths().list_pending().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, record.id);
        assert_eq!(listed[0].request.title, "Approve deploy");
    }

    #[tokio::test]
    async fn test_decision_file_resolves_and_cleans_up() {
        let (_dir, inbox) = inbox();
        let record = inbox.book().create(request("deploy"));
        inbox.notifier().notify(&record).await.unwrap();

        let written = inbox
            .paths()
            .submit(
                &record.id,
                &Decision {
                    approved: false,
                    comments: Some("freeze".into()),
                },
            )
            .unwrap();
        assert!(written.is_file());

        assert_eq!(inbox.apply_decisions().unwrap(), 1);
        let decided = inbox.book().get(&record.id).unwrap();
        assert_eq!(decided.status, ApprovalStatus::Rejected);
        assert_eq!(decided.comments.as_deref(), Some("freeze"));
        assert!(!written.exists());
        assert!(inbox.paths().list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_decisions_are_discarded() {
        let (_dir, inbox) = inbox();
        let stray = inbox
            .paths()
            .submit("0000-unknown", &Decision { approved: true, comments: None })
            .unwrap();
        let garbage = inbox.paths().decisions_dir().join("abc.json");
        std::fs::write(&garbage, "not json").unwrap();

        assert_eq!(inbox.apply_decisions().unwrap(), 0);
        assert!(!stray.exists());
        assert!(!garbage.exists());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let paths = InboxPaths::new("/tmp/inbox");
        for id in ["", "../etc/passwd", "a/b", "x.json"] {
            assert!(paths.submit(id, &Decision { approved: true, comments: None }).is_err(), "{id}");
        }
    }

    #[tokio::test]
    async fn test_stale_pending_files_are_pruned() {
        let (_dir, inbox) = inbox();
        let record = inbox.book().create(request("deploy"));
        inbox.notifier().notify(&record).await.unwrap();
        // The waiter gave up, so the request left the book.
        assert!(inbox.book().wait(&record.id, Duration::from_millis(1)).await.unwrap().is_none());

        inbox.apply_decisions().unwrap();
        assert!(inbox.paths().list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_reports_submitted_decision() {
        let (_dir, inbox) = inbox();
        let (_watcher, mut rx) = inbox.watch(Duration::from_millis(50)).unwrap();
        let record = inbox.book().create(request("deploy"));
        inbox
            .paths()
            .submit(&record.id, &Decision { approved: true, comments: None })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within timeout")
            .unwrap();
        assert_eq!(inbox.apply_decisions().unwrap(), 1);
        assert_eq!(inbox.book().get(&record.id).unwrap().status, ApprovalStatus::Approved);
    }
}
