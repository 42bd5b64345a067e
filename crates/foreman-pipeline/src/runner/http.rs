//! HTTP request runner.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{StepResult, StepRunner, required_str, timeout_param};
use crate::context::ExecutionContext;

/// Response bodies longer than this are cut in failure messages.
const ERROR_BODY_PREVIEW: usize = 500;

/// Performs one HTTP request.
///
/// Parameters: `url` (required), `method` (default `GET`), `headers`
/// (object of strings), `body` (objects and arrays are sent as JSON, other
/// values as text), `timeout_secs`. Output: `{status, headers, body}` where
/// `body` is parsed JSON when possible. Non-2xx responses fail the step and
/// keep the response as detail.
#[derive(Debug, Clone)]
pub struct HttpRunner {
    client: Client,
    default_timeout: Duration,
}

impl HttpRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            default_timeout,
        }
    }
}

#[async_trait]
impl StepRunner for HttpRunner {
    fn step_type(&self) -> &str {
        "http"
    }

    async fn execute(&self, step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let params = ctx.interpolate(params);
        let url = match required_str(&params, "url") {
            Ok(u) => u,
            Err(e) => return StepResult::failed(e),
        };
        let method_name = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = match Method::from_bytes(method_name.as_bytes()) {
            Ok(m) => m,
            Err(_) => return StepResult::failed(format!("Unsupported HTTP method: {method_name}")),
        };

        let mut request = self
            .client
            .request(method, url)
            .timeout(timeout_param(&params, self.default_timeout));
        if let Some(headers) = params.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(name.as_str(), v);
                }
            }
        }
        request = match params.get("body") {
            None | Some(Value::Null) => request,
            Some(body @ (Value::Object(_) | Value::Array(_))) => request.json(body),
            Some(Value::String(text)) => request.body(text.clone()),
            Some(other) => request.body(other.to_string()),
        };

        debug!(step_id, url, method = %method_name, "Sending HTTP request");
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                return StepResult::failed(format!("HTTP request failed: {e}"))
                    .with_duration(started.elapsed());
            }
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), json!(v))))
            .collect();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                return StepResult::failed(format!("Failed to read response body: {e}"))
                    .with_duration(started.elapsed());
            }
        };
        let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));
        let detail = json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        });

        let result = if status.is_success() {
            StepResult::completed(detail)
        } else {
            let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
            StepResult::failed_with(format!("HTTP {}: {preview}", status.as_u16()), detail)
        };
        result.with_duration(started.elapsed())
    }
}
