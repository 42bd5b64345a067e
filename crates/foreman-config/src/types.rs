//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [engine]      # failure policy, step timeout, worker count
//! [sandbox]     # generated-code isolation
//! [scheduler]   # trigger polling
//! [llm]         # language-model endpoint
//! [paths]       # workflow and generated-module directories
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    /// Workflow engine configuration.
    pub engine: Option<EngineSection>,

    /// Sandbox configuration for generated step logic.
    pub sandbox: Option<SandboxSection>,

    /// Trigger scheduler configuration.
    pub scheduler: Option<SchedulerSection>,

    /// Language-model endpoint configuration.
    pub llm: Option<LlmSection>,

    /// Filesystem locations.
    pub paths: Option<PathsSection>,
}

impl ForemanConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        let config: ForemanConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: ForemanConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }
        if other.sandbox.is_some() {
            self.sandbox = other.sandbox;
        }
        if other.scheduler.is_some() {
            self.scheduler = other.scheduler;
        }
        if other.llm.is_some() {
            self.llm = other.llm;
        }
        if other.paths.is_some() {
            self.paths = other.paths;
        }
    }

    /// Engine section, or defaults.
    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    /// Sandbox section, or defaults.
    pub fn sandbox(&self) -> SandboxSection {
        self.sandbox.clone().unwrap_or_default()
    }

    /// Scheduler section, or defaults.
    pub fn scheduler(&self) -> SchedulerSection {
        self.scheduler.clone().unwrap_or_default()
    }

    /// Paths section, or defaults.
    pub fn paths(&self) -> PathsSection {
        self.paths.clone().unwrap_or_default()
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(ref engine) = self.engine
            && engine.workers == 0
        {
            return Err(ConfigError::InvalidValue {
                field: "engine.workers".into(),
                reason: "must be at least 1".into(),
            });
        }
        if let Some(ref sandbox) = self.sandbox {
            if sandbox.timeout_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "sandbox.timeout_ms".into(),
                    reason: "must be greater than zero".into(),
                });
            }
            if sandbox.max_source_chars == 0 || sandbox.max_lines == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "sandbox.max_source_chars/max_lines".into(),
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if let Some(ref scheduler) = self.scheduler
            && scheduler.poll_interval_secs == 0
        {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.poll_interval_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Workflow engine configuration.
///
/// ```toml
/// [engine]
/// continue_on_failure = false
/// step_timeout_secs = 300
/// workers = 2
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Default failure policy for steps that don't set their own.
    pub continue_on_failure: bool,
    /// Default per-step timeout for shell and automation steps.
    pub step_timeout_secs: u64,
    /// Number of queue workers started by `foreman serve`.
    pub workers: usize,
    /// Default wait timeout for blocking approval steps.
    pub approval_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            continue_on_failure: false,
            step_timeout_secs: 300,
            workers: 2,
            approval_timeout_secs: 3600,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox
// ─────────────────────────────────────────────────────────────────────────────

/// How generated code is isolated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Restricted interpreter inside the worker process.
    InProcess,
    /// Child process with OS resource limits.
    Subprocess,
}

/// Sandbox configuration.
///
/// ```toml
/// [sandbox]
/// mode = "subprocess"
/// timeout_ms = 5000
/// memory_limit_mb = 64
/// cpu_time_secs = 5
/// max_source_chars = 50000
/// max_lines = 1000
/// allowed_modules = ["string", "table", "math", "utf8"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Isolation strategy.
    pub mode: SandboxMode,
    /// Wall-clock budget per execution, in milliseconds.
    pub timeout_ms: u64,
    /// Interpreter memory ceiling, in MiB.
    pub memory_limit_mb: u64,
    /// CPU-time ceiling applied to the child process, in seconds.
    pub cpu_time_secs: u64,
    /// Maximum source size in characters.
    pub max_source_chars: usize,
    /// Maximum number of source lines.
    pub max_lines: usize,
    /// Library modules generated code may reference.
    pub allowed_modules: Vec<String>,
    /// Binary providing the `sandbox-exec` entry point (defaults to the current executable).
    pub worker_binary: Option<PathBuf>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Subprocess,
            timeout_ms: 5_000,
            memory_limit_mb: 64,
            cpu_time_secs: 5,
            max_source_chars: 50_000,
            max_lines: 1_000,
            allowed_modules: vec![
                "string".to_string(),
                "table".to_string(),
                "math".to_string(),
                "utf8".to_string(),
            ],
            worker_binary: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Trigger scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Seconds between cron trigger evaluations.
    pub poll_interval_secs: u64,
    /// Half-width of the window around "now" in which a cron fire time counts.
    pub fire_window_secs: u64,
    /// Debounce for filesystem triggers.
    pub file_debounce_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            fire_window_secs: 60,
            file_debounce_ms: 500,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM
// ─────────────────────────────────────────────────────────────────────────────

/// Language-model endpoint (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// Base URL of the API.
    pub base_url: String,
    /// Default model.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

impl LlmSection {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Paths
// ─────────────────────────────────────────────────────────────────────────────

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Directory containing workflow definitions.
    pub workflow_dir: PathBuf,
    /// Directory where generated modules are written.
    pub module_dir: PathBuf,
    /// Approval inbox shared by `serve` and `approve`.
    pub approval_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            workflow_dir: PathBuf::from("workflows"),
            module_dir: PathBuf::from("modules"),
            approval_dir: PathBuf::from("approvals"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ForemanConfig::from_toml("").unwrap();
        assert!(config.engine.is_none());
        let engine = config.engine();
        assert!(!engine.continue_on_failure);
        assert_eq!(engine.workers, 2);
        assert_eq!(config.sandbox().mode, SandboxMode::Subprocess);
        assert_eq!(config.scheduler().poll_interval_secs, 60);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[engine]
continue_on_failure = true
step_timeout_secs = 10
workers = 4

[sandbox]
mode = "in_process"
timeout_ms = 250
allowed_modules = ["string"]

[scheduler]
poll_interval_secs = 5

[llm]
model = "local-model"
base_url = "http://localhost:11434/v1"

[paths]
workflow_dir = "/srv/workflows"
"#;
        let config = ForemanConfig::from_toml(toml).unwrap();
        let engine = config.engine();
        assert!(engine.continue_on_failure);
        assert_eq!(engine.workers, 4);
        let sandbox = config.sandbox();
        assert_eq!(sandbox.mode, SandboxMode::InProcess);
        assert_eq!(sandbox.timeout_ms, 250);
        assert_eq!(sandbox.allowed_modules, vec!["string"]);
        // unspecified fields keep their defaults
        assert_eq!(sandbox.max_lines, 1_000);
        assert_eq!(config.scheduler().fire_window_secs, 60);
        assert_eq!(config.llm.as_ref().unwrap().model, "local-model");
        assert_eq!(config.paths().workflow_dir, PathBuf::from("/srv/workflows"));
        assert_eq!(config.paths().module_dir, PathBuf::from("modules"));
        assert_eq!(config.paths().approval_dir, PathBuf::from("approvals"));
    }

    #[test]
    fn test_merge_overrides_sections() {
        let mut base = ForemanConfig::from_toml("[engine]\nworkers = 3\n").unwrap();
        let overlay = ForemanConfig::from_toml("[sandbox]\nmode = \"in_process\"\n").unwrap();
        base.merge(overlay);
        assert_eq!(base.engine().workers, 3);
        assert_eq!(base.sandbox().mode, SandboxMode::InProcess);

        let overlay = ForemanConfig::from_toml("[engine]\nworkers = 8\n").unwrap();
        base.merge(overlay);
        assert_eq!(base.engine().workers, 8);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = ForemanConfig::from_toml("[engine]\nworkers = 0\n").unwrap_err();
        assert!(err.to_string().contains("engine.workers"));
    }

    #[test]
    fn test_rejects_zero_sandbox_timeout() {
        let err = ForemanConfig::from_toml("[sandbox]\ntimeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("sandbox.timeout_ms"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = ForemanConfig::new();
        config.engine = Some(EngineSection {
            workers: 6,
            ..Default::default()
        });
        let text = config.to_toml().unwrap();
        let parsed = ForemanConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.engine().workers, 6);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!(ForemanConfig::from_toml("[sandbox]\nmode = \"docker\"\n").is_err());
    }
}
