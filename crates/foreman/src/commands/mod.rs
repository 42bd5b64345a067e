//! CLI command handlers.

pub mod approve;
pub mod config;
pub mod generate;
pub mod run;
pub mod sandbox_exec;
pub mod serve;
pub mod validate;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use foreman_config::{ForemanConfig, LoadedConfig, SandboxMode, SandboxSection};
use foreman_pipeline::runner::OpenAiClient;
use foreman_pipeline::{RunnerDeps, Workflow};
use foreman_sandbox::{ExecutionMode, SandboxConfig};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration and where it came from.
    pub loaded: LoadedConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    pub fn config(&self) -> &ForemanConfig {
        &self.loaded.config
    }
}

/// Map the `[sandbox]` section onto the executor configuration.
pub fn sandbox_config(section: &SandboxSection) -> SandboxConfig {
    let mode = match section.mode {
        SandboxMode::InProcess => ExecutionMode::InProcess,
        SandboxMode::Subprocess => ExecutionMode::Subprocess,
    };
    let memory_bytes = usize::try_from(section.memory_limit_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX);
    let config = SandboxConfig::default()
        .with_mode(mode)
        .with_timeout(Duration::from_millis(section.timeout_ms))
        .with_memory_limit(memory_bytes)
        .with_cpu_time(Duration::from_secs(section.cpu_time_secs))
        .with_source_limits(section.max_source_chars, section.max_lines)
        .with_allowed_modules(section.allowed_modules.clone());
    match &section.worker_binary {
        Some(path) => config.with_worker_binary(path),
        None => config,
    }
}

/// Runner dependencies built from configuration.
///
/// The language model is only wired in when an `[llm]` section is present.
pub fn runner_deps(config: &ForemanConfig, module_dir: &Path) -> Result<RunnerDeps> {
    let engine = config.engine();
    let mut deps = RunnerDeps::new(sandbox_config(&config.sandbox()), module_dir)
        .with_step_timeout(Duration::from_secs(engine.step_timeout_secs))
        .with_approval_timeout(Duration::from_secs(engine.approval_timeout_secs));
    if let Some(llm) = &config.llm {
        let client = OpenAiClient::from_config(llm).context("Failed to build language model client")?;
        deps = deps.with_language_model(Arc::new(client));
    }
    Ok(deps)
}

/// Parse and validate a workflow file.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let workflow = Workflow::from_file(path).with_context(|| format!("Failed to load {}", path.display()))?;
    workflow
        .validate()
        .with_context(|| format!("{} is not a valid workflow", path.display()))?;
    Ok(workflow)
}

/// Print a value as pretty JSON on stdout.
pub fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
