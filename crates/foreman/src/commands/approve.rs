//! Approve command - decide approval requests raised by a running `serve`.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use foreman_pipeline::{Decision, InboxPaths};
use serde_json::json;

use super::{Context, print_json};

/// Arguments for the approve command.
#[derive(Args, Debug)]
pub struct ApproveArgs {
    /// Approval id (see --list)
    #[arg(required_unless_present = "list")]
    pub id: Option<String>,

    /// Reject the request instead of approving it
    #[arg(long)]
    pub reject: bool,

    /// Comment recorded with the decision
    #[arg(long, short = 'm')]
    pub comment: Option<String>,

    /// Approval inbox (defaults to paths.approval_dir)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// List pending requests instead of deciding one
    #[arg(long, conflicts_with_all = ["id", "reject", "comment"])]
    pub list: bool,
}

/// Run the approve command.
pub async fn run(args: ApproveArgs, ctx: &Context) -> Result<()> {
    let inbox = InboxPaths::new(args.dir.unwrap_or_else(|| ctx.config().paths().approval_dir));
    let pending = inbox.list_pending()?;

    let Some(id) = args.id else {
        if ctx.json_output {
            return print_json(&pending);
        }
        if pending.is_empty() {
            println!("No pending approvals in {}", inbox.root().display());
        }
        for record in &pending {
            println!(
                "{}  {}  {}  {}",
                record.id,
                record.created_at.format("%Y-%m-%d %H:%M:%S"),
                record.request.step_id,
                record.request.title
            );
        }
        return Ok(());
    };

    if !pending.iter().any(|r| r.id == id) {
        bail!("No pending approval '{id}' in {}", inbox.root().display());
    }

    let decision = Decision {
        approved: !args.reject,
        comments: args.comment,
    };
    let path = inbox.submit(&id, &decision)?;

    if ctx.json_output {
        print_json(&json!({
            "id": id,
            "approved": decision.approved,
            "comments": decision.comments,
            "decision_file": path,
        }))?;
    } else {
        let verb = if decision.approved { "Approved" } else { "Rejected" };
        println!("{verb} {id}");
    }
    Ok(())
}
