//! Sandbox configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Isolation strategy for generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Restricted interpreter on a blocking thread of the calling process.
    ///
    /// The interpreter honours its deadline, but a thread stuck inside a
    /// native or dispatch call cannot be stopped from outside. On timeout the
    /// thread is abandoned and runs until that call returns. Use
    /// [`ExecutionMode::Subprocess`] when that matters.
    InProcess,
    /// Child process with OS resource limits, driven over stdio.
    Subprocess,
}

/// Configuration for sandboxed execution.
///
/// # Security Model
///
/// - **Static gate**: source is tokenized and rejected on denied names,
///   disallowed modules, introspection attributes, size and line ceilings.
/// - **Runtime surface**: only the `table`, `string`, `math` and `utf8`
///   libraries plus the `foreman` capability object are reachable.
/// - **Resources**: wall-clock deadline and interpreter memory ceiling in
///   both modes; address-space and CPU-time rlimits in subprocess mode.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Which isolation strategy to use.
    pub mode: ExecutionMode,

    /// Wall-clock budget per execution.
    pub timeout: Duration,

    /// Interpreter memory ceiling in bytes.
    pub memory_limit_bytes: usize,

    /// CPU-time ceiling for the worker process.
    pub cpu_time: Duration,

    /// Maximum source size in characters.
    pub max_source_chars: usize,

    /// Maximum number of source lines.
    pub max_lines: usize,

    /// Library modules the code may `require`.
    pub allowed_modules: Vec<String>,

    /// Binary providing the `sandbox-exec` subcommand.
    pub worker_binary: Option<PathBuf>,

    /// Extra time granted to the worker before it is killed.
    pub kill_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Subprocess,
            timeout: Duration::from_secs(5),
            memory_limit_bytes: 64 * 1024 * 1024,
            cpu_time: Duration::from_secs(5),
            max_source_chars: 50_000,
            max_lines: 1_000,
            allowed_modules: Self::default_allowed_modules(),
            worker_binary: None,
            kill_grace: Duration::from_millis(500),
        }
    }
}

impl SandboxConfig {
    /// Create a new sandbox configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation strategy.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the interpreter memory ceiling.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set the worker CPU-time ceiling.
    pub fn with_cpu_time(mut self, cpu_time: Duration) -> Self {
        self.cpu_time = cpu_time;
        self
    }

    /// Set the source size ceilings.
    pub fn with_source_limits(mut self, max_chars: usize, max_lines: usize) -> Self {
        self.max_source_chars = max_chars;
        self.max_lines = max_lines;
        self
    }

    /// Replace the module allow-list.
    pub fn with_allowed_modules(mut self, modules: Vec<String>) -> Self {
        self.allowed_modules = modules;
        self
    }

    /// Add one module to the allow-list.
    pub fn allow_module(mut self, module: impl Into<String>) -> Self {
        self.allowed_modules.push(module.into());
        self
    }

    /// Set the worker binary.
    pub fn with_worker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_binary = Some(path.into());
        self
    }

    /// Modules reachable by default.
    pub fn default_allowed_modules() -> Vec<String> {
        ["string", "table", "math", "utf8"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Whether `module` is on the allow-list.
    pub fn is_module_allowed(&self, module: &str) -> bool {
        self.allowed_modules.iter().any(|m| m == module)
    }

    /// Resolve the worker binary, falling back to the current executable.
    pub fn resolve_worker_binary(&self) -> std::io::Result<PathBuf> {
        match &self.worker_binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.mode, ExecutionMode::Subprocess);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.memory_limit_bytes, 64 * 1024 * 1024);
        assert!(config.is_module_allowed("string"));
        assert!(!config.is_module_allowed("io"));
        assert!(config.worker_binary.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        let config = SandboxConfig::new()
            .with_mode(ExecutionMode::InProcess)
            .with_timeout(Duration::from_millis(250))
            .with_source_limits(100, 10)
            .allow_module("coroutine")
            .with_worker_binary("/usr/local/bin/foreman");

        assert_eq!(config.mode, ExecutionMode::InProcess);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.max_source_chars, 100);
        assert_eq!(config.max_lines, 10);
        assert!(config.is_module_allowed("coroutine"));
        assert_eq!(
            config.resolve_worker_binary().unwrap(),
            PathBuf::from("/usr/local/bin/foreman")
        );
    }

    #[test]
    fn test_worker_binary_defaults_to_current_exe() {
        let config = SandboxConfig::default();
        let resolved = config.resolve_worker_binary().unwrap();
        assert_eq!(resolved, std::env::current_exe().unwrap());
    }
}
