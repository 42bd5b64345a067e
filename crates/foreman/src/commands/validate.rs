//! Validate command - check a workflow file and show its execution order.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use foreman_pipeline::{ExecutionGraph, PipelineError, Workflow, default_registry};
use serde_json::json;

use super::{Context, print_json, runner_deps};

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Workflow file (.toml or .json)
    pub file: PathBuf,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let workflow = Workflow::from_file(&args.file)?;

    let order = match workflow
        .validate()
        .and_then(|()| ExecutionGraph::build(&workflow))
        .and_then(|graph| graph.topological_order())
    {
        Ok(order) => order,
        Err(PipelineError::CycleDetected { nodes }) => {
            if ctx.json_output {
                print_json(&json!({"valid": false, "cycle": nodes}))?;
            } else {
                println!("Cycle detected among: {}", nodes.join(", "));
            }
            bail!("{} contains a cycle", args.file.display());
        }
        Err(e) => return Err(e.into()),
    };

    // Step types are checked against the built-in registry.
    let registry = default_registry(runner_deps(ctx.config(), &ctx.config().paths().module_dir)?);
    let unknown: Vec<String> = workflow
        .resolved_nodes()
        .into_iter()
        .filter(|n| !registry.contains(&n.step_type))
        .map(|n| format!("{} ({})", n.id, n.step_type))
        .collect();
    if !unknown.is_empty() {
        bail!("Unknown step types: {}", unknown.join(", "));
    }

    if ctx.json_output {
        print_json(&json!({
            "valid": true,
            "workflow_id": workflow.id,
            "order": order,
            "triggers": workflow.triggers.len(),
        }))?;
    } else {
        println!("{} is valid", workflow.id);
        println!("order: {}", order.join(" -> "));
        if ctx.verbose {
            for trigger in &workflow.triggers {
                println!("trigger: {trigger:?}");
            }
        }
    }
    Ok(())
}
