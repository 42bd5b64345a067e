//! Trigger evaluation and the background scheduler loop.
//!
//! Cron triggers are evaluated on a polling interval. A cron expression
//! fires when its next occurrence after the last fire (or after the
//! workflow's `updated_at` for the first fire) falls inside a window around
//! now. The occurrence time itself is recorded as the last fire, so one
//! occurrence can never be enqueued twice, and a trigger fires at most once
//! per window.
//!
//! File-watch triggers run off debounced filesystem events and enqueue on
//! their own. Inside a composite they only raise a flag that the next
//! evaluation consumes.
//!
//! The scheduler never runs workflows; it only enqueues
//! [`ExecutionRequest`]s.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use foreman_config::SchedulerSection;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::definition::{CompositeMode, TriggerDefinition, Workflow};
use crate::error::{PipelineError, Result};
use crate::queue::{ExecutionRequest, TaskQueue};
use crate::store::WorkflowStore;
use crate::watch::{PathWatcher, watch_path};

// ─────────────────────────────────────────────────────────────────────────────
// Cron evaluation
// ─────────────────────────────────────────────────────────────────────────────

/// Decide whether a cron trigger fires at `now`.
///
/// Returns the occurrence being fired, or `None`. The search starts at the
/// latest of `base`, `last_fired` and `now - window`, and the occurrence
/// must not lie beyond `now + window`. A trigger that already fired inside
/// the current window does not fire again.
pub fn should_fire(
    expression: &str,
    base: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<Option<DateTime<Utc>>> {
    let cron = expression
        .parse::<croner::Cron>()
        .map_err(|e| PipelineError::Scheduling(format!("Invalid cron expression '{expression}': {e}")))?;
    let window = TimeDelta::from_std(window)
        .map_err(|e| PipelineError::Scheduling(format!("Invalid fire window: {e}")))?;

    let mut from = base.max(now - window);
    if let Some(last) = last_fired {
        if last > now - window {
            return Ok(None);
        }
        from = from.max(last);
    }
    Ok(cron.iter_after(from).next().filter(|next| *next <= now + window))
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Half-width of the cron fire window.
    pub fire_window: Duration,
    pub file_debounce: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            fire_window: Duration::from_secs(60),
            file_debounce: Duration::from_millis(500),
        }
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            poll_interval: Duration::from_secs(section.poll_interval_secs.max(1)),
            fire_window: Duration::from_secs(section.fire_window_secs),
            file_debounce: Duration::from_millis(section.file_debounce_ms),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// A side effect to commit once a trigger is known to fire.
enum Effect {
    Cron { key: String, at: DateTime<Utc> },
    Files { key: String },
}

struct FileWatch {
    _watcher: PathWatcher,
    task: JoinHandle<()>,
}

impl Drop for FileWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct TriggerState {
    /// `"<workflow>#<trigger address>"` → last fired occurrence.
    last_fired: HashMap<String, DateTime<Utc>>,
    /// Composite file-watch children with unconsumed events.
    file_events: HashMap<String, Vec<PathBuf>>,
    watchers: HashMap<String, FileWatch>,
}

/// Evaluates the triggers of every active workflow and enqueues runs.
pub struct TriggerScheduler {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn TaskQueue>,
    config: SchedulerConfig,
    state: Arc<Mutex<TriggerState>>,
}

impl TriggerScheduler {
    pub fn new(store: Arc<dyn WorkflowStore>, queue: Arc<dyn TaskQueue>, config: SchedulerConfig) -> Self {
        Self {
            store,
            queue,
            config,
            state: Arc::new(Mutex::new(TriggerState::default())),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Number of live file watches.
    pub fn watch_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    /// Run the polling loop until `stop` flips to `true`.
    pub fn spawn(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                poll_interval_secs = self.config.poll_interval.as_secs(),
                "Trigger scheduler started"
            );
            loop {
                if *stop.borrow() {
                    break;
                }
                if let Err(e) = self.tick(Utc::now()).await {
                    error!(error = %e, "Trigger evaluation failed");
                }
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
            self.state.lock().watchers.clear();
            info!("Trigger scheduler stopped");
        })
    }

    /// Evaluate every active workflow once. Returns how many requests were
    /// enqueued.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let workflows = self.active_workflows().await?;
        self.sync_watchers(&workflows);

        let mut enqueued = 0;
        for workflow in &workflows {
            for (index, trigger) in workflow.triggers.iter().enumerate() {
                if matches!(trigger, TriggerDefinition::FileWatch { .. }) {
                    continue;
                }
                let key = format!("{}#{index}", workflow.id);
                let effects = {
                    let state = self.state.lock();
                    match self.check(&state, workflow, trigger, &key, now) {
                        Ok(effects) => effects,
                        Err(e) => {
                            warn!(workflow_id = %workflow.id, trigger = index, error = %e, "Skipping trigger");
                            continue;
                        }
                    }
                };
                let Some(effects) = effects else {
                    continue;
                };
                self.commit(effects);

                let reason = match trigger {
                    TriggerDefinition::Cron { .. } => "cron",
                    _ => "composite",
                };
                let request = ExecutionRequest::new(&workflow.id)
                    .with_reason(reason)
                    .with_input(json!({"trigger": reason, "fired_at": now.to_rfc3339()}));
                match self.queue.enqueue(request).await {
                    Ok(()) => {
                        info!(workflow_id = %workflow.id, trigger = index, reason, "Trigger fired");
                        enqueued += 1;
                    }
                    Err(e) => error!(workflow_id = %workflow.id, error = %e, "Failed to enqueue triggered run"),
                }
            }
        }
        Ok(enqueued)
    }

    /// Bring file watches in line with the store without evaluating cron
    /// or composite triggers. Call after workflows are added or removed.
    pub async fn refresh(&self) -> Result<()> {
        let workflows = self.active_workflows().await?;
        self.sync_watchers(&workflows);
        Ok(())
    }

    async fn active_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self
            .store
            .list_workflows()
            .await?
            .into_iter()
            .filter(Workflow::is_active)
            .collect())
    }

    fn check(
        &self,
        state: &TriggerState,
        workflow: &Workflow,
        trigger: &TriggerDefinition,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Effect>>> {
        match trigger {
            TriggerDefinition::Cron { expression } => {
                let last = state.last_fired.get(key).copied();
                let at = should_fire(expression, workflow.updated_at, last, now, self.config.fire_window)?;
                Ok(at.map(|at| {
                    vec![Effect::Cron {
                        key: key.to_string(),
                        at,
                    }]
                }))
            }
            TriggerDefinition::FileWatch { .. } => {
                let fired = state.file_events.get(key).is_some_and(|paths| !paths.is_empty());
                Ok(fired.then(|| vec![Effect::Files { key: key.to_string() }]))
            }
            TriggerDefinition::Composite { mode, triggers } => {
                let mut effects = Vec::new();
                let mut satisfied = 0;
                for (i, child) in triggers.iter().enumerate() {
                    let child_key = format!("{key}.{i}");
                    if let Some(found) = self.check(state, workflow, child, &child_key, now)? {
                        satisfied += 1;
                        effects.extend(found);
                    }
                }
                let fired = match mode {
                    CompositeMode::And => !triggers.is_empty() && satisfied == triggers.len(),
                    CompositeMode::Or => satisfied > 0,
                };
                Ok(fired.then_some(effects))
            }
        }
    }

    fn commit(&self, effects: Vec<Effect>) {
        let mut state = self.state.lock();
        for effect in effects {
            match effect {
                Effect::Cron { key, at } => {
                    state.last_fired.insert(key, at);
                }
                Effect::Files { key } => {
                    state.file_events.remove(&key);
                }
            }
        }
    }

    /// Start watches for new file triggers and drop watches whose workflow
    /// is gone or inactive.
    fn sync_watchers(&self, workflows: &[Workflow]) {
        let mut wanted = Vec::new();
        for workflow in workflows {
            for (index, trigger) in workflow.triggers.iter().enumerate() {
                collect_file_triggers(workflow, trigger, format!("{}#{index}", workflow.id), false, &mut wanted);
            }
        }

        let keys: HashSet<&str> = wanted.iter().map(|w| w.key.as_str()).collect();
        {
            let mut state = self.state.lock();
            state.watchers.retain(|key, _| keys.contains(key.as_str()));
            state.file_events.retain(|key, _| keys.contains(key.as_str()));
        }

        for spec in wanted {
            if self.state.lock().watchers.contains_key(&spec.key) {
                continue;
            }
            let key = spec.key.clone();
            match self.start_watch(spec) {
                Ok(watch) => {
                    self.state.lock().watchers.insert(key, watch);
                }
                Err(e) => warn!(trigger = %key, error = %e, "Could not start file trigger"),
            }
        }
    }

    fn start_watch(&self, spec: FileTrigger) -> Result<FileWatch> {
        let pattern = spec
            .pattern
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| PipelineError::Scheduling(format!("Invalid file pattern: {e}")))?;
        let (watcher, mut rx) = watch_path(&spec.path, spec.recursive, self.config.file_debounce)?;
        let mut known = existing_files(&spec.path, spec.recursive);

        let queue = Arc::clone(&self.queue);
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                for path in batch {
                    if !path.is_file() || !known.insert(path.clone()) {
                        continue;
                    }
                    if let Some(pattern) = &pattern
                        && !matches_pattern(pattern, &path)
                    {
                        continue;
                    }
                    debug!(trigger = %spec.key, path = %path.display(), "File created");

                    if spec.nested {
                        state.lock().file_events.entry(spec.key.clone()).or_default().push(path);
                        continue;
                    }
                    let request = ExecutionRequest::new(&spec.workflow_id)
                        .with_reason(format!("file_watch:{}", path.display()))
                        .with_input(json!({"trigger": "file_watch", "path": path.display().to_string()}));
                    match queue.enqueue(request).await {
                        Ok(()) => info!(workflow_id = %spec.workflow_id, path = %path.display(), "File trigger fired"),
                        Err(e) => error!(workflow_id = %spec.workflow_id, error = %e, "Failed to enqueue file-triggered run"),
                    }
                }
            }
        });

        Ok(FileWatch {
            _watcher: watcher,
            task,
        })
    }
}

impl std::fmt::Debug for TriggerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerScheduler")
            .field("config", &self.config)
            .field("watches", &self.watch_count())
            .finish()
    }
}

struct FileTrigger {
    key: String,
    workflow_id: String,
    path: PathBuf,
    pattern: Option<String>,
    recursive: bool,
    /// Part of a composite: raise a flag instead of enqueueing.
    nested: bool,
}

fn collect_file_triggers(
    workflow: &Workflow,
    trigger: &TriggerDefinition,
    key: String,
    nested: bool,
    out: &mut Vec<FileTrigger>,
) {
    match trigger {
        TriggerDefinition::FileWatch {
            path,
            pattern,
            recursive,
        } => out.push(FileTrigger {
            key,
            workflow_id: workflow.id.clone(),
            path: path.clone(),
            pattern: pattern.clone(),
            recursive: *recursive,
            nested,
        }),
        TriggerDefinition::Composite { triggers, .. } => {
            for (i, child) in triggers.iter().enumerate() {
                collect_file_triggers(workflow, child, format!("{key}.{i}"), true, out);
            }
        }
        TriggerDefinition::Cron { .. } => {}
    }
}

/// Patterns with a `/` match the whole path, others the file name.
fn matches_pattern(pattern: &glob::Pattern, path: &Path) -> bool {
    if pattern.as_str().contains('/') {
        return pattern.matches_path(path);
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| pattern.matches(name))
}

fn existing_files(root: &Path, recursive: bool) -> HashSet<PathBuf> {
    let mut found = HashSet::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else {
                found.insert(path);
            }
        }
    }
    found
}
