//! Configuration system for the Foreman workflow engine.
//!
//! Provides TOML-based configuration with:
//! - Engine failure policy and worker sizing (`[engine]`)
//! - Sandbox isolation mode and resource ceilings (`[sandbox]`)
//! - Trigger polling cadence (`[scheduler]`)
//! - Language-model endpoint used by `llm` and `rag_decision` steps (`[llm]`)
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
