//! Retrieval collaborator and the `rag_decision` runner.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::llm::{CompletionRequest, LanguageModel};
use super::{StepResult, StepRunner, required_str};
use crate::context::ExecutionContext;
use crate::error::Result;

const DEFAULT_LIMIT: usize = 5;

/// One retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub content: String,
    pub score: f64,
}

/// Looks up passages relevant to a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return at most `limit` documents from `sources` (all sources when
    /// empty), best first.
    async fn retrieve(&self, query: &str, sources: &[String], limit: usize) -> Result<Vec<Document>>;
}

/// In-memory retriever scoring documents by query term overlap.
#[derive(Debug, Default)]
pub struct KeywordRetriever {
    documents: RwLock<Vec<Document>>,
}

impl KeywordRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, source: impl Into<String>, id: impl Into<String>, content: impl Into<String>) {
        self.documents.write().push(Document {
            id: id.into(),
            source: source.into(),
            content: content.into(),
            score: 0.0,
        });
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(&self, query: &str, sources: &[String], limit: usize) -> Result<Vec<Document>> {
        let wanted = terms(query);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<Document> = self
            .documents
            .read()
            .iter()
            .filter(|d| sources.is_empty() || sources.contains(&d.source))
            .filter_map(|d| {
                let overlap = terms(&d.content).intersection(&wanted).count();
                (overlap > 0).then(|| Document {
                    score: overlap as f64 / wanted.len() as f64,
                    ..d.clone()
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(limit);
        Ok(hits)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

/// Retrieves context, asks the model to pick one of a fixed set of
/// outcomes, and reports the choice.
///
/// Parameters: `query` (required), `sources` or `data_sources`, `outcomes`
/// (required, non-empty list of strings), `limit` (default 5), `prompt`
/// (extra instructions), `system`, `model`, `temperature`, `max_tokens`.
///
/// An answer that matches no outcome falls back to the first outcome and
/// sets `fallback: true` in the output.
pub struct RagDecisionRunner {
    retriever: Arc<dyn Retriever>,
    model: Option<Arc<dyn LanguageModel>>,
}

impl RagDecisionRunner {
    pub fn new(retriever: Arc<dyn Retriever>, model: Option<Arc<dyn LanguageModel>>) -> Self {
        Self { retriever, model }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn build_prompt(query: &str, outcomes: &[String], documents: &[Document], extra: Option<&str>) -> String {
    let mut prompt = String::new();
    if !documents.is_empty() {
        prompt.push_str("Context:\n");
        for doc in documents {
            prompt.push_str(&format!("[{}:{}] {}\n", doc.source, doc.id, doc.content));
        }
        prompt.push('\n');
    }
    if let Some(extra) = extra {
        prompt.push_str(extra);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("Question: {query}\n"));
    prompt.push_str(&format!(
        "Answer with exactly one of: {}\n",
        outcomes.join(", ")
    ));
    prompt
}

/// Map a model answer onto one of the allowed outcomes.
fn match_outcome(answer: &str, outcomes: &[String]) -> Option<String> {
    let cleaned = answer
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if let Some(exact) = outcomes.iter().find(|o| o.to_lowercase() == cleaned) {
        return Some(exact.clone());
    }
    // The answer may be a sentence naming the outcome; accept it only when
    // exactly one outcome appears.
    let words = terms(answer);
    let mentioned: Vec<&String> = outcomes
        .iter()
        .filter(|o| words.contains(&o.to_lowercase()))
        .collect();
    match mentioned.as_slice() {
        [single] => Some((*single).clone()),
        _ => None,
    }
}

#[async_trait]
impl StepRunner for RagDecisionRunner {
    fn step_type(&self) -> &str {
        "rag_decision"
    }

    async fn execute(&self, step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let Some(model) = &self.model else {
            return StepResult::failed("No language model is configured");
        };
        let params = ctx.interpolate(params);
        let query = match required_str(&params, "query") {
            Ok(q) => q,
            Err(e) => return StepResult::failed(e),
        };
        let outcomes = string_list(params.get("outcomes"));
        if outcomes.is_empty() {
            return StepResult::failed("Parameter 'outcomes' must be a non-empty list of strings");
        }
        let sources = string_list(params.get("sources").or_else(|| params.get("data_sources")));
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_LIMIT);

        let documents = match self.retriever.retrieve(query, &sources, limit).await {
            Ok(docs) => docs,
            Err(e) => return StepResult::failed(e.to_string()).with_duration(started.elapsed()),
        };
        debug!(step_id, documents = documents.len(), "Retrieved context for decision");

        let prompt = build_prompt(
            query,
            &outcomes,
            &documents,
            params.get("prompt").and_then(Value::as_str),
        );
        let request = CompletionRequest::new(prompt).with_params(&params);
        let answer = match model.complete(request).await {
            Ok(a) => a,
            Err(e) => return StepResult::failed(e.to_string()).with_duration(started.elapsed()),
        };

        let (decision, fallback) = match match_outcome(&answer, &outcomes) {
            Some(d) => (d, false),
            None => {
                warn!(
                    step_id,
                    answer = %answer.trim(),
                    fallback = %outcomes[0],
                    "Model answer matched no outcome, using the first outcome"
                );
                (outcomes[0].clone(), true)
            }
        };

        StepResult::completed(json!({
            "decision": decision,
            "raw_response": answer,
            "fallback": fallback,
            "documents": documents,
        }))
        .with_duration(started.elapsed())
    }
}
