//! Generate command - produce sandboxed modules for dynamic steps.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use foreman_pipeline::{ModuleGenerator, ModuleStore};
use serde_json::json;

use super::{Context, load_workflow, print_json, sandbox_config};

/// Arguments for the generate command.
#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Workflow file (.toml or .json)
    pub file: PathBuf,

    /// Output directory (defaults to paths.module_dir)
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

/// Run the generate command.
pub async fn run(args: GenerateArgs, ctx: &Context) -> Result<()> {
    let workflow = load_workflow(&args.file)?;
    let out = args.out.unwrap_or_else(|| ctx.config().paths().module_dir);

    let generator = ModuleGenerator::new(sandbox_config(&ctx.config().sandbox()), ModuleStore::new(&out));
    let modules = generator.generate_for_workflow(&workflow).await?;

    if ctx.json_output {
        let entries: Vec<_> = modules
            .iter()
            .map(|m| {
                json!({
                    "step_id": m.manifest.step_id,
                    "dir": m.dir,
                    "nodes": m.manifest.nodes,
                })
            })
            .collect();
        return print_json(&json!({"workflow_id": workflow.id, "modules": entries}));
    }

    if modules.is_empty() {
        println!("{} has no dynamic steps", workflow.id);
        return Ok(());
    }
    for module in &modules {
        println!(
            "generated {}/{} -> {} ({} sub-steps)",
            workflow.id,
            module.manifest.step_id,
            module.dir.display(),
            module.manifest.nodes.len()
        );
    }
    Ok(())
}
