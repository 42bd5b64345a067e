//! Language model collaborator and the `llm` runner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use foreman_config::LlmSection;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::{StepResult, StepRunner, required_str};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};

/// One prompt for a language model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    /// Model override; the client default is used when `None`.
    pub model: Option<String>,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Read the optional tuning parameters shared by model-backed runners.
    pub(crate) fn with_params(mut self, params: &Value) -> Self {
        self.model = params.get("model").and_then(Value::as_str).map(String::from);
        self.system = params.get("system").and_then(Value::as_str).map(String::from);
        self.temperature = params.get("temperature").and_then(Value::as_f64);
        self.max_tokens = params
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|n| n as u32);
        self
    }
}

/// Anything that turns a prompt into text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI-compatible client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Collaborator(format!("Failed to create HTTP client: {e}")))?;
        Ok(self)
    }

    /// Build a client from the `[llm]` configuration section.
    pub fn from_config(section: &LlmSection) -> Result<Self> {
        let mut client = Self::new(&section.base_url, &section.model)
            .with_timeout(Duration::from_secs(section.timeout_secs))?;
        if let Some(key) = section.api_key() {
            client = client.with_api_key(key);
        }
        Ok(client)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        let body = ChatRequest {
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        debug!(model, url = %self.completions_url(), "Sending chat completion request");
        let mut builder = self
            .client
            .post(self.completions_url())
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PipelineError::Collaborator(format!("Language model request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Collaborator(format!(
                "Language model returned {}: {text}",
                status.as_u16()
            )));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            PipelineError::Collaborator(format!("Malformed language model response: {e}"))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PipelineError::Collaborator("Language model returned no content".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

/// Sends an interpolated prompt to the language model.
///
/// Parameters: `prompt` (required), `system`, `model`, `temperature`,
/// `max_tokens`, `output_schema`. Output: `{text, model}` plus `parsed`
/// when the schema check passes or `schema_error` when it does not. A
/// schema mismatch never fails the step.
pub struct LlmRunner {
    model: Option<Arc<dyn LanguageModel>>,
}

impl LlmRunner {
    pub fn new(model: Option<Arc<dyn LanguageModel>>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl StepRunner for LlmRunner {
    fn step_type(&self) -> &str {
        "llm"
    }

    async fn execute(&self, step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let Some(model) = &self.model else {
            return StepResult::failed("No language model is configured");
        };
        let params = ctx.interpolate(params);
        let prompt = match required_str(&params, "prompt") {
            Ok(p) => p,
            Err(e) => return StepResult::failed(e),
        };
        if let Some(provider) = params.get("provider").and_then(Value::as_str) {
            debug!(step_id, provider, "Provider hint ignored by the configured model client");
        }

        let request = CompletionRequest::new(prompt).with_params(&params);
        let text = match model.complete(request).await {
            Ok(t) => t,
            Err(e) => return StepResult::failed(e.to_string()).with_duration(started.elapsed()),
        };

        let mut output = json!({
            "text": text,
            "model": params.get("model").cloned().unwrap_or(Value::Null),
        });
        if let Some(schema) = params.get("output_schema") {
            match check_schema(&text, schema) {
                Ok(parsed) => output["parsed"] = parsed,
                Err(e) => {
                    debug!(step_id, error = %e, "Model output does not match schema");
                    output["schema_error"] = Value::String(e);
                }
            }
        }
        StepResult::completed(output).with_duration(started.elapsed())
    }
}

/// Keys an output schema requires.
///
/// Accepts a JSON-schema style `{"required": [...]}`, a plain list of keys,
/// or an object whose keys are all required.
fn required_keys(schema: &Value) -> Vec<String> {
    match schema {
        Value::Array(keys) => keys.iter().filter_map(|k| k.as_str().map(String::from)).collect(),
        Value::Object(map) => match map.get("required").and_then(Value::as_array) {
            Some(keys) => keys.iter().filter_map(|k| k.as_str().map(String::from)).collect(),
            None => map
                .get("properties")
                .and_then(Value::as_object)
                .unwrap_or(map)
                .keys()
                .cloned()
                .collect(),
        },
        _ => Vec::new(),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse model output as JSON and check the schema's required keys.
pub(crate) fn check_schema(text: &str, schema: &Value) -> std::result::Result<Value, String> {
    let parsed: Value = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| format!("Response is not valid JSON: {e}"))?;
    let Value::Object(map) = &parsed else {
        return Err("Response is not a JSON object".to_string());
    };
    let missing: Vec<String> = required_keys(schema)
        .into_iter()
        .filter(|k| !map.contains_key(k))
        .collect();
    if !missing.is_empty() {
        return Err(format!("Missing required keys: {}", missing.join(", ")));
    }
    Ok(parsed)
}
