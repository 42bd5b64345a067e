//! Foreman - workflow orchestration with generated, sandboxed step logic.
//!
//! Main entry point for the Foreman CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{approve, config, generate, run, sandbox_exec, serve, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Foreman - workflow orchestration with generated, sandboxed step logic
#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow file once and print the execution record
    Run(run::RunArgs),

    /// Check a workflow file and print its execution order
    Validate(validate::ValidateArgs),

    /// Generate modules for the dynamic steps of a workflow file
    Generate(generate::GenerateArgs),

    /// Load the workflow directory and run triggers and workers until Ctrl-C
    Serve(serve::ServeArgs),

    /// Approve or reject a request raised under `serve`
    Approve(approve::ApproveArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Sandbox child process entry point
    #[command(hide = true)]
    SandboxExec(sandbox_exec::SandboxExecArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The sandbox child talks to its parent over stdout, so it gets a
    // stderr-only subscriber and no async runtime.
    let command = match cli.command {
        Commands::SandboxExec(args) => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(tracing_subscriber::EnvFilter::new("foreman_sandbox=warn"))
                .init();
            return sandbox_exec::run(args);
        }
        command => command,
    };

    // Console (human-readable, stderr) + rotating JSON file
    let filter = if cli.verbose {
        "foreman=debug,foreman_pipeline=debug,foreman_sandbox=debug,foreman_config=debug,info"
    } else {
        "foreman=info,foreman_pipeline=info,foreman_sandbox=info,foreman_config=info,warn"
    };

    let log_dir = foreman_config::user_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "foreman.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "foreman=trace,foreman_pipeline=trace,foreman_sandbox=trace,foreman_config=trace,info",
                )),
        )
        .init();

    let loaded = foreman_config::load_config(None)?;
    for warning in &loaded.warnings {
        tracing::warn!("{warning}");
    }

    let ctx = commands::Context {
        loaded,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match command {
            Commands::Run(args) => run::run(args, &ctx).await,
            Commands::Validate(args) => validate::run(args, &ctx).await,
            Commands::Generate(args) => generate::run(args, &ctx).await,
            Commands::Serve(args) => serve::run(args, &ctx).await,
            Commands::Approve(args) => approve::run(args, &ctx).await,
            Commands::Config(args) => config::run(args, &ctx).await,
            Commands::SandboxExec(args) => sandbox_exec::run(args),
        }
    })
}
