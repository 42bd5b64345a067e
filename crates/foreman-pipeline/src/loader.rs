//! Workflow directory loader.
//!
//! Loads every `*.toml` / `*.json` workflow in a directory into the store
//! and can keep watching it: created or modified files are (re)loaded and
//! deleted files remove their workflow. A file that fails to parse or
//! validate is reported and skipped; it never blocks the others.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::definition::Workflow;
use crate::error::{PipelineError, Result};
use crate::store::WorkflowStore;
use crate::watch::{PathWatcher, watch_path};

/// Event emitted when workflow files change.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// A workflow was loaded or updated.
    Loaded { id: String, path: PathBuf },
    /// A workflow was removed.
    Removed { id: String, path: PathBuf },
    /// A workflow file failed to parse or validate.
    Error { path: PathBuf, error: String },
}

/// Keeps a directory watch alive. Drop it to stop watching.
pub struct WatcherHandle {
    _watcher: PathWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Syncs a directory of workflow files into a [`WorkflowStore`].
#[derive(Clone)]
pub struct WorkflowLoader {
    workflow_dir: PathBuf,
    store: Arc<dyn WorkflowStore>,
    /// File path → workflow id, for delete handling.
    path_to_id: Arc<RwLock<HashMap<PathBuf, String>>>,
}

impl WorkflowLoader {
    /// Create a loader for `workflow_dir`, creating the directory if needed.
    pub fn new(workflow_dir: impl Into<PathBuf>, store: Arc<dyn WorkflowStore>) -> Result<Self> {
        let workflow_dir = workflow_dir.into();
        if !workflow_dir.exists() {
            std::fs::create_dir_all(&workflow_dir).map_err(|e| {
                PipelineError::Validation(format!(
                    "Failed to create workflow directory {}: {e}",
                    workflow_dir.display()
                ))
            })?;
        }
        Ok(Self {
            workflow_dir,
            store,
            path_to_id: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn workflow_dir(&self) -> &Path {
        &self.workflow_dir
    }

    /// Load every workflow file in the directory, in file-name order.
    pub async fn load_all(&self) -> Vec<WorkflowEvent> {
        let entries = match std::fs::read_dir(&self.workflow_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(dir = %self.workflow_dir.display(), error = %e, "Failed to read workflow directory");
                return Vec::new();
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| is_workflow_file(p))
            .collect();
        paths.sort();

        let mut events = Vec::with_capacity(paths.len());
        for path in paths {
            events.push(self.load_file(&path).await);
        }
        let loaded = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::Loaded { .. }))
            .count();
        info!(dir = %self.workflow_dir.display(), loaded, "Loaded workflows");
        events
    }

    /// Load or reload a single workflow file.
    pub async fn load_file(&self, path: &Path) -> WorkflowEvent {
        debug!(path = %path.display(), "Loading workflow file");
        let workflow = match Workflow::from_file(path).and_then(|wf| wf.validate().map(|()| wf)) {
            Ok(wf) => wf,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Invalid workflow file");
                return WorkflowEvent::Error {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                };
            }
        };

        let id = workflow.id.clone();
        let previous = self.path_to_id.read().get(path).cloned();
        if let Some(old) = previous.filter(|old| *old != id) {
            debug!(old = %old, new = %id, "Workflow file changed id");
            if let Err(e) = self.store.remove_workflow(&old).await {
                warn!(workflow_id = %old, error = %e, "Failed to remove renamed workflow");
            }
        }
        if let Err(e) = self.store.put_workflow(workflow).await {
            return WorkflowEvent::Error {
                path: path.to_path_buf(),
                error: e.to_string(),
            };
        }
        self.path_to_id.write().insert(path.to_path_buf(), id.clone());

        info!(workflow_id = %id, path = %path.display(), "Workflow loaded");
        WorkflowEvent::Loaded {
            id,
            path: path.to_path_buf(),
        }
    }

    /// Handle a deleted file. `None` if the file never loaded.
    pub async fn remove_file(&self, path: &Path) -> Option<WorkflowEvent> {
        let id = self.path_to_id.write().remove(path)?;
        if let Err(e) = self.store.remove_workflow(&id).await {
            warn!(workflow_id = %id, error = %e, "Failed to remove workflow");
        }
        info!(workflow_id = %id, path = %path.display(), "Workflow removed");
        Some(WorkflowEvent::Removed {
            id,
            path: path.to_path_buf(),
        })
    }

    /// Number of files currently loaded.
    pub fn len(&self) -> usize {
        self.path_to_id.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the directory and apply changes as they happen.
    pub fn watch(&self, debounce: Duration) -> Result<(mpsc::Receiver<WorkflowEvent>, WatcherHandle)> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (watcher, mut batches) = watch_path(&self.workflow_dir, false, debounce)?;

        let loader = self.clone();
        let task = tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                for path in batch {
                    if !is_workflow_file(&path) || !path.starts_with(&loader.workflow_dir) {
                        continue;
                    }
                    let event = if path.exists() {
                        Some(loader.load_file(&path).await)
                    } else {
                        loader.remove_file(&path).await
                    };
                    if let Some(event) = event
                        && event_tx.send(event).await.is_err()
                    {
                        return;
                    }
                }
            }
        });

        Ok((
            event_rx,
            WatcherHandle {
                _watcher: watcher,
                task,
            },
        ))
    }
}

impl std::fmt::Debug for WorkflowLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowLoader")
            .field("workflow_dir", &self.workflow_dir)
            .field("loaded", &self.len())
            .finish()
    }
}

fn is_workflow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("toml") | Some("json")
    )
}
