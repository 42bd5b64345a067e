//! Human approval runner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{StepResult, StepRunner, required_str, timeout_param};
use crate::approval::{ApprovalBook, ApprovalNotifier, ApprovalRequest, ApprovalStatus};
use crate::context::ExecutionContext;

/// Opens an approval request and optionally waits for the decision.
///
/// Parameters: `title` (required), `description`, `approvers` (list of
/// strings), `wait` (default `false`), `timeout_secs`.
///
/// With `wait = false` the step returns a pending result carrying the
/// approval id. With `wait = true` it suspends until the request is
/// resolved; a rejection or a timeout fails the step.
pub struct ApprovalRunner {
    book: Arc<ApprovalBook>,
    notifier: Arc<dyn ApprovalNotifier>,
    default_timeout: Duration,
}

impl ApprovalRunner {
    pub fn new(
        book: Arc<ApprovalBook>,
        notifier: Arc<dyn ApprovalNotifier>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            book,
            notifier,
            default_timeout,
        }
    }
}

#[async_trait]
impl StepRunner for ApprovalRunner {
    fn step_type(&self) -> &str {
        "approval"
    }

    async fn execute(&self, step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let params = ctx.interpolate(params);
        let title = match required_str(&params, "title") {
            Ok(t) => t.to_string(),
            Err(e) => return StepResult::failed(e),
        };
        let approvers = params
            .get("approvers")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(|a| a.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let execution_id = Some(ctx.execution_id().to_string()).filter(|id| !id.is_empty());

        let record = self.book.create(ApprovalRequest {
            execution_id,
            step_id: step_id.to_string(),
            title,
            description: params
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            approvers,
        });
        if let Err(e) = self.notifier.notify(&record).await {
            warn!(step_id, approval_id = %record.id, error = %e, "Failed to notify approvers");
        }

        let wait = params.get("wait").and_then(Value::as_bool).unwrap_or(false);
        if !wait {
            debug!(step_id, approval_id = %record.id, "Approval pending, not waiting");
            return StepResult::pending(json!({
                "approval_id": record.id,
                "status": ApprovalStatus::Pending,
            }))
            .with_duration(started.elapsed());
        }

        let limit = timeout_param(&params, self.default_timeout);
        let result = match self.book.wait(&record.id, limit).await {
            Ok(Some(decided)) if decided.status == ApprovalStatus::Approved => {
                StepResult::completed(json!({
                    "approval_id": decided.id,
                    "approved": true,
                    "comments": decided.comments,
                }))
            }
            Ok(Some(decided)) => StepResult::failed_with(
                format!(
                    "Approval rejected{}",
                    decided.comments.as_deref().map(|c| format!(": {c}")).unwrap_or_default()
                ),
                json!({"approval_id": decided.id, "approved": false, "comments": decided.comments}),
            ),
            Ok(None) => StepResult::failed_with(
                format!("Approval timed out after {limit:?}"),
                json!({"approval_id": record.id}),
            ),
            Err(e) => StepResult::failed(e.to_string()),
        };
        result.with_duration(started.elapsed())
    }
}
