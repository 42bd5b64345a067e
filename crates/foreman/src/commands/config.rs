//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use foreman_config::ForemanConfig;
use serde_json::json;

use super::{Context, print_json};

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./foreman.toml) instead of user config
        #[arg(long)]
        local: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Init { local, force } => cmd_init(local, force),
        ConfigCommand::Path => cmd_path(),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;
    // Fill every section so the output documents the effective values.
    let config = effective(ctx.config());

    if ctx.json_output {
        return print_json(&json!({
            "config": config,
            "sources": loaded.loaded_from(),
            "warnings": loaded.warnings,
        }));
    }

    println!("# Foreman Configuration\n");
    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("# No config files loaded (using defaults)\n");
    } else {
        for source in &sources {
            println!("# from {}", source.display());
        }
        println!();
    }
    for w in &loaded.warnings {
        println!("# warning: {w}");
    }
    println!("{}", config.to_toml()?);
    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    println!("Config file search order (later overrides earlier):\n");
    for source in &ctx.loaded.sources {
        let status = if source.loaded { "loaded   " } else { "not found" };
        println!("  {status} {}", source.path.display());
    }

    println!();
    let loaded_count = ctx.loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'foreman config init' to create one.");
    } else {
        println!("{loaded_count} config file(s) loaded.");
    }
    Ok(())
}

fn cmd_init(local: bool, force: bool) -> Result<()> {
    let path = if local {
        PathBuf::from("foreman.toml")
    } else {
        match foreman_config::user_config_path() {
            Some(p) => p,
            None => bail!("Could not determine the user config directory"),
        }
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    foreman_config::save_config(&effective(&ForemanConfig::new()), &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn cmd_path() -> Result<()> {
    match foreman_config::user_config_path() {
        Some(p) => println!("{}", p.display()),
        None => bail!("Could not determine the user config directory"),
    }
    Ok(())
}

/// `config` with every defaulted section made explicit.
///
/// `[llm]` stays absent unless configured: its presence turns on the
/// language-model client.
fn effective(config: &ForemanConfig) -> ForemanConfig {
    ForemanConfig {
        engine: Some(config.engine()),
        sandbox: Some(config.sandbox()),
        scheduler: Some(config.scheduler()),
        llm: config.llm.clone(),
        paths: Some(config.paths()),
    }
}
