//! Dynamic module generation.
//!
//! A `dynamic` node carries a sub-workflow (`{nodes, edges}` or legacy
//! `{steps}`), possibly written by a language model. The generator turns it
//! into a Lua module that dispatches each sub-step through the host's
//! runners, plus a self-test module, and only marks the pair eligible once
//! both have passed:
//!
//! 1. sanitize every untrusted string and key
//! 2. render `module.lua` and `module_test.lua`
//! 3. static validation through the sandbox validator
//! 4. in-process dry run against an empty context with a stub dispatcher
//! 5. write both files, then run the self-test through the configured sandbox
//! 6. write `manifest.json` with the source hashes
//!
//! Any failure removes the module directory, so a half-generated module is
//! never loadable.
//!
//! # Layout
//!
//! ```text
//! <module_dir>/<workflow_id>/<step_id>/
//! ├── module.lua
//! ├── module_test.lua
//! └── manifest.json
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_sandbox::{
    DispatchRequest, ExecutionMode, SandboxConfig, SandboxExecutor, StepDispatcher,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::definition::{
    EdgeDefinition, NodeDefinition, StepDefinition, Workflow, check_id_len, resolve_graph,
};
use crate::error::{PipelineError, Result};
use crate::graph::ExecutionGraph;

/// Longest string embedded into generated source, in characters.
pub const MAX_EMBEDDED_STRING: usize = 1000;

/// Input guard ceilings baked into every generated module.
const MAX_INPUT_KEYS: usize = 256;
const MAX_INPUT_STRING_LEN: usize = 100_000;

const MODULE_FILE: &str = "module.lua";
const TEST_FILE: &str = "module_test.lua";
const MANIFEST_FILE: &str = "manifest.json";

// ─────────────────────────────────────────────────────────────────────────────
// Sanitization
// ─────────────────────────────────────────────────────────────────────────────

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Escape `s` for embedding between double quotes in Lua source.
///
/// The input is cut to [`MAX_EMBEDDED_STRING`] characters first. Backslashes,
/// both quote characters and whitespace escapes are escaped, other control
/// characters become decimal byte escapes, and `]]` is broken up so the
/// text can never close a long bracket.
pub fn sanitize_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_EMBEDDED_STRING) + 8);
    for c in s.chars().take(MAX_EMBEDDED_STRING) {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    let _ = write!(out, "\\{byte:03}");
                }
            }
            c => out.push(c),
        }
    }
    out.replace("]]", "]\\x5D")
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !key.starts_with("__")
}

/// Keep identifier-shaped keys; replace anything else with a stable
/// `k_<hash>` name.
pub fn sanitize_key(key: &str) -> String {
    if is_identifier(key) {
        return key.to_string();
    }
    format!("k_{}", &sha256_hex(key)[..12])
}

/// Apply [`sanitize_key`] and [`sanitize_string`] throughout a JSON tree.
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_string(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (sanitize_key(k), sanitize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// Render an already-sanitized value as a Lua expression.
fn lua_literal(value: &Value, indent: usize, out: &mut String) {
    match value {
        Value::Null => out.push_str("nil"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        Value::Array(items) if items.is_empty() => out.push_str("{}"),
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Array(items) => {
            out.push_str("{\n");
            for item in items {
                out.push_str(&"  ".repeat(indent + 1));
                lua_literal(item, indent + 1, out);
                out.push_str(",\n");
            }
            out.push_str(&"  ".repeat(indent));
            out.push('}');
        }
        Value::Object(map) => {
            out.push_str("{\n");
            for (key, item) in map {
                let _ = write!(out, "{}[\"{key}\"] = ", "  ".repeat(indent + 1));
                lua_literal(item, indent + 1, out);
                out.push_str(",\n");
            }
            out.push_str(&"  ".repeat(indent));
            out.push('}');
        }
    }
}

/// A sub-workflow ready to render: sanitized nodes in execution order.
#[derive(Debug, Clone)]
struct Plan {
    workflow_id: String,
    step_id: String,
    /// Original node ids, in execution order.
    node_ids: Vec<String>,
    /// `(id, type, params)` with every string already escaped.
    nodes: Vec<(String, String, Value)>,
}

#[derive(Debug, Default, Deserialize)]
struct SubWorkflow {
    #[serde(default)]
    nodes: Vec<NodeDefinition>,
    #[serde(default)]
    edges: Vec<EdgeDefinition>,
    #[serde(default)]
    steps: Vec<StepDefinition>,
}

impl Plan {
    fn build(workflow_id: &str, step_id: &str, spec: &Value) -> Result<Self> {
        let sub: SubWorkflow = serde_json::from_value(spec.clone())
            .map_err(|e| PipelineError::Generation(format!("Malformed sub-workflow: {e}")))?;
        let (nodes, edges) = resolve_graph(&sub.nodes, &sub.edges, &sub.steps);
        if nodes.is_empty() {
            return Err(PipelineError::Generation(
                "Sub-workflow has no nodes or steps".to_string(),
            ));
        }
        for node in &nodes {
            check_id_len("Sub-step", &node.id).map_err(PipelineError::Generation)?;
        }
        if let Some(nested) = nodes.iter().find(|n| n.step_type == "dynamic") {
            return Err(PipelineError::Generation(format!(
                "Sub-step '{}' is itself dynamic; nesting is not supported",
                nested.id
            )));
        }

        let graph = ExecutionGraph::from_parts(
            nodes.iter().map(|n| n.id.clone()),
            edges.iter().map(|e| (e.source.clone(), e.target.clone())),
        )
        .map_err(|e| PipelineError::Generation(e.to_string()))?;
        let order = graph
            .topological_order()
            .map_err(|e| PipelineError::Generation(e.to_string()))?;

        let mut ordered = Vec::with_capacity(order.len());
        for id in &order {
            if let Some(node) = nodes.iter().find(|n| &n.id == id) {
                ordered.push((
                    sanitize_string(&node.id),
                    sanitize_string(&node.step_type),
                    sanitize_value(&node.params()),
                ));
            }
        }

        Ok(Self {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            node_ids: order,
            nodes: ordered,
        })
    }

    /// Header, input guard, node table and the `run` function.
    fn render_body(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "-- Generated by foreman for workflow \"{}\" step \"{}\". Do not edit.",
            sanitize_string(&self.workflow_id),
            sanitize_string(&self.step_id)
        );
        let _ = write!(
            out,
            r#"
local MAX_INPUT_KEYS = {MAX_INPUT_KEYS}
local MAX_STRING_LEN = {MAX_INPUT_STRING_LEN}

local function validate_input(ctx)
  if type(ctx) ~= "table" then
    error("context must be a table")
  end
  local count = 0
  for key, value in pairs(ctx) do
    count = count + 1
    if count > MAX_INPUT_KEYS then
      error("context has more than " .. MAX_INPUT_KEYS .. " keys")
    end
    if type(value) == "string" and #value > MAX_STRING_LEN then
      error("context value '" .. tostring(key) .. "' is too long")
    end
  end
end

local NODES = {{
"#
        );
        for (id, kind, params) in &self.nodes {
            let _ = write!(out, "  {{\n    id = \"{id}\",\n    kind = \"{kind}\",\n    params = ");
            lua_literal(params, 2, &mut out);
            out.push_str(",\n  },\n");
        }
        out.push_str(
            r#"}

local function run(ctx)
  validate_input(ctx)
  local outcomes = {}
  for _, node in ipairs(NODES) do
    local outcome = foreman.dispatch(node.id, node.kind, node.params)
    outcomes[node.id] = outcome
    if type(outcome) ~= "table" or outcome.success ~= true then
      ctx.failed_step = node.id
      return outcomes
    end
  end
  return outcomes
end
"#,
        );
        out
    }

    fn render_module(&self) -> String {
        let mut out = self.render_body();
        out.push_str("\ncontext.outcomes = run(context)\n");
        out
    }

    fn render_self_test(&self) -> String {
        let mut out = self.render_body();
        out.push_str(
            r#"
local results = {}
local function check(name, ok)
  results[#results + 1] = { name = name, passed = ok == true }
end

local scratch = {}
local ok, outcomes = pcall(run, scratch)
check("returns_outcome_table", ok and type(outcomes) == "table" and scratch.failed_step == nil)
local well_formed = ok and type(outcomes) == "table"
if well_formed then
  for _, node in ipairs(NODES) do
    local outcome = outcomes[node.id]
    if type(outcome) ~= "table" or type(outcome.success) ~= "boolean" then
      well_formed = false
    end
  end
end
check("outcomes_well_formed", well_formed)

check("rejects_non_table_input", not pcall(validate_input, "text"))

local oversized = {}
for i = 1, MAX_INPUT_KEYS + 1 do
  oversized["k" .. i] = i
end
check("rejects_oversized_input", not pcall(validate_input, oversized))
check("rejects_long_string", not pcall(validate_input, { text = string.rep("x", MAX_STRING_LEN + 1) }))

local passed = true
for _, result in ipairs(results) do
  if not result.passed then
    passed = false
  end
end
context.self_test = { passed = passed, results = results }
"#,
        );
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Artifact store
// ─────────────────────────────────────────────────────────────────────────────

/// Eligibility marker written once a module passed every gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub workflow_id: String,
    pub step_id: String,
    pub source_sha256: String,
    pub test_sha256: String,
    pub generated_at: DateTime<Utc>,
    /// Sub-step ids in execution order.
    pub nodes: Vec<String>,
    pub eligible: bool,
}

/// A generated module and where it lives.
#[derive(Debug, Clone)]
pub struct GeneratedModule {
    pub dir: PathBuf,
    pub source: String,
    pub test_source: String,
    pub manifest: ModuleManifest,
}

/// Locates generated modules on disk.
#[derive(Debug, Clone)]
pub struct ModuleStore {
    root: PathBuf,
}

fn check_component(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::Validation(format!(
            "{kind} '{value}' may only contain letters, digits, '_' and '-'"
        )))
    }
}

impl ModuleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one `(workflow, step)` pair.
    pub fn module_dir(&self, workflow_id: &str, step_id: &str) -> Result<PathBuf> {
        check_component("Workflow id", workflow_id)?;
        check_component("Step id", step_id)?;
        Ok(self.root.join(workflow_id).join(step_id))
    }

    /// Whether an eligible module exists.
    pub fn exists(&self, workflow_id: &str, step_id: &str) -> bool {
        self.module_dir(workflow_id, step_id)
            .map(|dir| dir.join(MANIFEST_FILE).is_file())
            .unwrap_or(false)
    }

    /// Load an eligible module, verifying it against its manifest.
    ///
    /// Returns `Ok(None)` when nothing eligible was generated for the pair.
    pub fn load(&self, workflow_id: &str, step_id: &str) -> Result<Option<GeneratedModule>> {
        let dir = self.module_dir(workflow_id, step_id)?;
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Ok(None);
        }
        let manifest: ModuleManifest = serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)
            .map_err(|e| PipelineError::Generation(format!("Corrupt manifest: {e}")))?;
        if !manifest.eligible {
            return Ok(None);
        }

        let source = std::fs::read_to_string(dir.join(MODULE_FILE))?;
        let test_source = std::fs::read_to_string(dir.join(TEST_FILE))?;
        if sha256_hex(&source) != manifest.source_sha256 || sha256_hex(&test_source) != manifest.test_sha256 {
            return Err(PipelineError::Generation(format!(
                "Module for {workflow_id}/{step_id} was modified after generation"
            )));
        }
        Ok(Some(GeneratedModule {
            dir,
            source,
            test_source,
            manifest,
        }))
    }

    /// Delete a module and its directory.
    pub fn remove(&self, workflow_id: &str, step_id: &str) -> Result<()> {
        let dir = self.module_dir(workflow_id, step_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generator
// ─────────────────────────────────────────────────────────────────────────────

/// Answers every dispatch with a successful empty outcome.
#[derive(Default)]
struct StubDispatcher {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl StepDispatcher for StubDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Value {
        self.calls.lock().push(request.step_id);
        json!({
            "success": true,
            "result": {},
            "error": null,
            "status": "completed",
        })
    }
}

/// Runs the generation pipeline.
#[derive(Debug, Clone)]
pub struct ModuleGenerator {
    executor: SandboxExecutor,
    dry_run: SandboxExecutor,
    store: ModuleStore,
}

impl ModuleGenerator {
    pub fn new(config: SandboxConfig, store: ModuleStore) -> Self {
        let dry_run = SandboxExecutor::new(config.clone().with_mode(ExecutionMode::InProcess));
        Self {
            executor: SandboxExecutor::new(config),
            dry_run,
            store,
        }
    }

    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    /// Generate modules for every `dynamic` node of `workflow`.
    pub async fn generate_for_workflow(&self, workflow: &Workflow) -> Result<Vec<GeneratedModule>> {
        let mut generated = Vec::new();
        for node in workflow.resolved_nodes() {
            if node.step_type == "dynamic" {
                generated.push(self.generate(&workflow.id, &node.id, &node.params()).await?);
            }
        }
        Ok(generated)
    }

    /// Generate, test and store the module for one dynamic step.
    pub async fn generate(
        &self,
        workflow_id: &str,
        step_id: &str,
        spec: &Value,
    ) -> Result<GeneratedModule> {
        let dir = self.store.module_dir(workflow_id, step_id)?;
        match self.try_generate(&dir, workflow_id, step_id, spec).await {
            Ok(module) => {
                info!(
                    workflow_id,
                    step_id,
                    nodes = module.manifest.nodes.len(),
                    "Generated dynamic module"
                );
                Ok(module)
            }
            Err(e) => {
                warn!(workflow_id, step_id, error = %e, "Module generation failed");
                if let Err(cleanup) = self.store.remove(workflow_id, step_id) {
                    warn!(dir = %dir.display(), error = %cleanup, "Failed to remove partial module");
                }
                Err(e)
            }
        }
    }

    async fn try_generate(
        &self,
        dir: &Path,
        workflow_id: &str,
        step_id: &str,
        spec: &Value,
    ) -> Result<GeneratedModule> {
        let plan = Plan::build(workflow_id, step_id, spec)?;
        let source = plan.render_module();
        let test_source = plan.render_self_test();

        let violations: Vec<String> = self
            .executor
            .check(&source)
            .into_iter()
            .chain(self.executor.check(&test_source))
            .map(|v| v.to_string())
            .collect();
        if !violations.is_empty() {
            return Err(PipelineError::Generation(format!(
                "Generated source failed validation: {}",
                violations.join("; ")
            )));
        }

        self.dry_run_module(&plan, &source).await?;

        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(MODULE_FILE), &source)?;
        std::fs::write(dir.join(TEST_FILE), &test_source)?;
        self.run_self_test(&test_source).await?;

        let manifest = ModuleManifest {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            source_sha256: sha256_hex(&source),
            test_sha256: sha256_hex(&test_source),
            generated_at: Utc::now(),
            nodes: plan.node_ids.clone(),
            eligible: true,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| PipelineError::Generation(format!("Failed to encode manifest: {e}")))?;
        std::fs::write(dir.join(MANIFEST_FILE), manifest_json)?;

        Ok(GeneratedModule {
            dir: dir.to_path_buf(),
            source,
            test_source,
            manifest,
        })
    }

    async fn dry_run_module(&self, plan: &Plan, source: &str) -> Result<()> {
        let stub = Arc::new(StubDispatcher::default());
        let dispatcher: Arc<dyn StepDispatcher> = stub.clone();
        let context = Value::Object(Map::new());
        let mutated = self
            .dry_run
            .try_execute(source, &context, Some(dispatcher))
            .await
            .map_err(|e| PipelineError::Generation(format!("Dry run failed: {e}")))?;

        let outcomes = mutated.get("outcomes").and_then(Value::as_object);
        let missing: Vec<&String> = plan
            .node_ids
            .iter()
            .filter(|id| !outcomes.is_some_and(|o| o.contains_key(id.as_str())))
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Generation(format!(
                "Dry run produced no outcome for: {}",
                missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }
        debug!(dispatched = stub.calls.lock().len(), "Dry run passed");
        Ok(())
    }

    async fn run_self_test(&self, test_source: &str) -> Result<()> {
        let stub: Arc<dyn StepDispatcher> = Arc::new(StubDispatcher::default());
        let mutated = self
            .executor
            .try_execute(test_source, &Value::Object(Map::new()), Some(stub))
            .await
            .map_err(|e| PipelineError::Generation(format!("Self-test did not run: {e}")))?;

        let report = mutated.get("self_test").cloned().unwrap_or(Value::Null);
        if report.get("passed").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let failed: Vec<String> = report
            .get("results")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter(|r| r.get("passed").and_then(Value::as_bool) != Some(true))
                    .filter_map(|r| r.get("name").and_then(Value::as_str).map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Err(PipelineError::Generation(format!(
            "Self-test failed: {}",
            if failed.is_empty() {
                "no report".to_string()
            } else {
                failed.join(", ")
            }
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn generator(dir: &Path) -> ModuleGenerator {
        let config = SandboxConfig::default()
            .with_mode(ExecutionMode::InProcess)
            .with_timeout(Duration::from_secs(5));
        ModuleGenerator::new(config, ModuleStore::new(dir))
    }

    fn spec() -> Value {
        json!({
            "nodes": [
                {"id": "notify", "type": "http", "data": {"url": "https://example.com/${fetch.body}"}},
                {"id": "fetch", "type": "shell", "data": {"command": "echo \"hi\"", "timeout_secs": 5}},
            ],
            "edges": [{"source": "fetch", "target": "notify"}],
        })
    }

    #[test]
    fn test_sanitize_string_escapes() {
        assert_eq!(sanitize_string(r#"a"b'c\d"#), r#"a\"b\'c\\d"#);
        assert_eq!(sanitize_string("line1\nline2\r\t"), "line1\\nline2\\r\\t");
        assert_eq!(sanitize_string("x]]y"), "x]\\x5Dy");
        assert_eq!(sanitize_string("nul\u{0}bell\u{7}"), "nul\\000bell\\007");
        assert_eq!(sanitize_string("\u{85}"), "\\194\\133");
    }

    #[test]
    fn test_sanitize_string_caps_length() {
        let long = "é".repeat(MAX_EMBEDDED_STRING + 50);
        assert_eq!(sanitize_string(&long).chars().count(), MAX_EMBEDDED_STRING);
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("url"), "url");
        assert_eq!(sanitize_key("_private1"), "_private1");
        let hashed = sanitize_key("Content-Type");
        assert!(hashed.starts_with("k_"));
        assert_eq!(hashed.len(), 14);
        assert_eq!(hashed, sanitize_key("Content-Type"));
        assert!(sanitize_key("__index").starts_with("k_"));
        assert!(sanitize_key("1abc").starts_with("k_"));
        assert!(sanitize_key("").starts_with("k_"));
    }

    #[test]
    fn test_sanitize_value_recurses() {
        let out = sanitize_value(&json!({"a b": ["x\"y", {"__gc": 1}], "ok": null}));
        let key = sanitize_key("a b");
        assert_eq!(out[&key][0], "x\\\"y");
        assert!(out[&key][1].get("__gc").is_none());
        assert!(out["ok"].is_null());
    }

    #[test]
    fn test_render_orders_nodes_and_passes_validation() {
        let plan = Plan::build("wf", "dyn", &spec()).unwrap();
        assert_eq!(plan.node_ids, vec!["fetch", "notify"]);
        let source = plan.render_module();
        assert!(source.find("id = \"fetch\"").unwrap() < source.find("id = \"notify\"").unwrap());
        assert!(source.contains("\"echo \\\"hi\\\"\""));
        assert!(!source.contains("timeout_secs"));
        assert!(source.trim_end().ends_with("context.outcomes = run(context)"));

        let executor = SandboxExecutor::new(SandboxConfig::default());
        assert!(executor.check(&source).is_empty(), "{:?}", executor.check(&source));
        let test_source = plan.render_self_test();
        assert!(executor.check(&test_source).is_empty(), "{:?}", executor.check(&test_source));
    }

    #[test]
    fn test_hostile_strings_stay_inert() {
        let spec = json!({"steps": [{
            "id": "evil\"]] os.execute('rm -rf /') --[[",
            "type": "shell",
            "data": {"command": "\"); os.exit(1); (\"", "__index": "x"},
        }]});
        let plan = Plan::build("wf", "dyn", &spec).unwrap();
        let source = plan.render_module();
        let executor = SandboxExecutor::new(SandboxConfig::default());
        assert!(executor.check(&source).is_empty(), "{:?}", executor.check(&source));
    }

    #[test]
    fn test_plan_rejects_bad_specs() {
        assert!(matches!(
            Plan::build("wf", "d", &json!({})),
            Err(PipelineError::Generation(_))
        ));
        let cyclic = json!({
            "nodes": [{"id": "a", "type": "shell"}, {"id": "b", "type": "shell"}],
            "edges": [{"source": "a", "target": "b"}, {"source": "b", "target": "a"}],
        });
        assert!(Plan::build("wf", "d", &cyclic).unwrap_err().to_string().contains("Cycle"));
        let nested = json!({"steps": [{"id": "inner", "type": "dynamic"}]});
        assert!(Plan::build("wf", "d", &nested).is_err());
    }

    #[test]
    fn test_plan_rejects_ids_that_would_be_truncated() {
        let long = "s".repeat(MAX_EMBEDDED_STRING + 1);
        let spec = json!({"steps": [{"id": long, "type": "shell"}]});
        let err = Plan::build("wf", "d", &spec).unwrap_err();
        assert!(matches!(err, PipelineError::Generation(ref m) if m.contains("Sub-step id")));

        let at_limit = "s".repeat(crate::definition::MAX_ID_LEN);
        let spec = json!({"steps": [{"id": at_limit.clone(), "type": "shell"}]});
        let plan = Plan::build("wf", "d", &spec).unwrap();
        assert_eq!(plan.node_ids, vec![at_limit.clone()]);
        assert_eq!(plan.nodes[0].0, at_limit);
    }

    #[tokio::test]
    async fn test_generate_writes_eligible_module() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());
        let module = generator.generate("wf-1", "dyn", &spec()).await.unwrap();

        assert!(module.dir.join(MODULE_FILE).is_file());
        assert!(module.dir.join(TEST_FILE).is_file());
        assert!(module.manifest.eligible);
        assert_eq!(module.manifest.nodes, vec!["fetch", "notify"]);

        let loaded = generator.store().load("wf-1", "dyn").unwrap().unwrap();
        assert_eq!(loaded.source, module.source);
        assert!(generator.store().exists("wf-1", "dyn"));
    }

    #[tokio::test]
    async fn test_tampered_module_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());
        let module = generator.generate("wf-1", "dyn", &spec()).await.unwrap();
        std::fs::write(module.dir.join(MODULE_FILE), "context.outcomes = {}").unwrap();
        assert!(matches!(
            generator.store().load("wf-1", "dyn"),
            Err(PipelineError::Generation(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_generation_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());
        generator.generate("wf-1", "dyn", &spec()).await.unwrap();

        let err = generator
            .generate("wf-1", "dyn", &json!({"steps": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Generation(_)));
        assert!(!dir.path().join("wf-1").join("dyn").exists());
        assert!(generator.store().load("wf-1", "dyn").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_module_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::default()
            .with_mode(ExecutionMode::InProcess)
            .with_source_limits(50_000, 40);
        let generator = ModuleGenerator::new(config, ModuleStore::new(dir.path()));
        let err = generator.generate("wf", "dyn", &spec()).await.unwrap_err();
        assert!(err.to_string().contains("failed validation"));
    }

    #[tokio::test]
    async fn test_generate_for_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = Workflow::new("wf-2", "Dyn")
            .with_node("plain", "shell", json!({"command": "true"}))
            .with_node("dyn", "dynamic", spec())
            .with_edge("plain", "dyn");
        let modules = generator(dir.path()).generate_for_workflow(&workflow).await.unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].manifest.step_id, "dyn");
    }

    #[test]
    fn test_module_dir_rejects_path_tricks() {
        let store = ModuleStore::new("/tmp/modules");
        assert!(store.module_dir("wf", "step-1").is_ok());
        assert!(store.module_dir("../etc", "x").is_err());
        assert!(store.module_dir("wf", "a/b").is_err());
        assert!(store.module_dir("", "x").is_err());
    }
}
