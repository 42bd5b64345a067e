//! Debounced filesystem watching shared by the loader and file triggers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Keeps a watch alive. Dropping it stops delivery.
pub struct PathWatcher {
    path: PathBuf,
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl PathWatcher {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for PathWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathWatcher").field("path", &self.path).finish()
    }
}

/// Watch `path` and deliver each debounced batch of changed paths.
///
/// The debouncer calls back on its own thread; batches are forwarded over
/// an unbounded channel so no runtime handle is needed there.
pub fn watch_path(
    path: &Path,
    recursive: bool,
    debounce: Duration,
) -> Result<(PathWatcher, mpsc::UnboundedReceiver<Vec<PathBuf>>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watched = path.to_path_buf();

    let mut debouncer = new_debouncer(debounce, move |res: DebounceEventResult| match res {
        Ok(events) => {
            let paths: Vec<PathBuf> = events.into_iter().map(|e| e.path).collect();
            if !paths.is_empty() {
                let _ = tx.send(paths);
            }
        }
        Err(e) => warn!(error = ?e, "File watch error"),
    })
    .map_err(|e| PipelineError::Scheduling(format!("Failed to create file watcher: {e}")))?;

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    debouncer.watcher().watch(path, mode).map_err(|e| {
        PipelineError::Scheduling(format!("Failed to watch {}: {e}", path.display()))
    })?;
    debug!(path = %path.display(), recursive, "Watching path");

    Ok((
        PathWatcher {
            path: watched,
            _debouncer: debouncer,
        },
        rx,
    ))
}
