//! Per-execution context and `${...}` interpolation.
//!
//! The context holds the execution input and the output of every step that
//! completed successfully. Each output is reachable under the step id and
//! under the `<step_id>_output` alias.
//!
//! # Placeholder syntax
//!
//! - `${name}` looks up an input key or a step id
//! - `${step.field}` / `${step.items.0}` walks into objects and arrays
//! - `${input.field}` reads the raw execution input
//!
//! Only scalar values (strings, numbers, booleans) are substituted. A
//! placeholder that resolves to an object, array or null, or to nothing at
//! all, is left in place untouched. A string consisting of exactly one
//! placeholder keeps the scalar's JSON type.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

const OUTPUT_SUFFIX: &str = "_output";

/// Mutable key/value store scoped to one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    workflow_id: String,
    execution_id: String,
    input: Value,
    outputs: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
            input: Value::Object(Map::new()),
            outputs: BTreeMap::new(),
        }
    }

    /// Seed the context with the execution input.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = match input {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Record a successful step's output.
    pub fn record_output(&mut self, step_id: impl Into<String>, value: Value) {
        self.outputs.insert(step_id.into(), value);
    }

    /// Whether `step_id` has a recorded output.
    pub fn has_output(&self, step_id: &str) -> bool {
        self.outputs.contains_key(step_id)
    }

    /// Look up a key or a dotted path.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.root(key) {
            return Some(value);
        }
        let mut segments = key.split('.');
        let mut current = self.root(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn root(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.outputs.get(key) {
            return Some(value);
        }
        if let Some(step) = key.strip_suffix(OUTPUT_SUFFIX)
            && let Some(value) = self.outputs.get(step)
        {
            return Some(value);
        }
        if key == "input" {
            return Some(&self.input);
        }
        self.input.get(key)
    }

    /// The whole context as one JSON object.
    pub fn snapshot(&self) -> Value {
        let mut map = Map::new();
        if let Value::Object(input) = &self.input {
            for (k, v) in input {
                map.insert(k.clone(), v.clone());
            }
        }
        map.insert("input".to_string(), self.input.clone());
        for (step, value) in &self.outputs {
            map.insert(step.clone(), value.clone());
            map.insert(format!("{step}{OUTPUT_SUFFIX}"), value.clone());
        }
        Value::Object(map)
    }

    /// A copy exposing only the input and the outputs of `ancestors`.
    pub fn visible_to(&self, ancestors: &HashSet<String>) -> ExecutionContext {
        ExecutionContext {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
            input: self.input.clone(),
            outputs: self
                .outputs
                .iter()
                .filter(|(step, _)| ancestors.contains(step.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Resolve placeholders throughout a JSON tree.
    pub fn interpolate(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.interpolate_value(s),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.interpolate(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.interpolate(v)).collect()),
            other => other.clone(),
        }
    }

    /// Resolve placeholders in a string, always producing a string.
    pub fn interpolate_str(&self, template: &str) -> String {
        match self.interpolate_value(template) {
            Value::String(s) => s,
            other => scalar_to_string(&other).unwrap_or_default(),
        }
    }

    fn interpolate_value(&self, template: &str) -> Value {
        let placeholders = find_placeholders(template);
        if placeholders.is_empty() {
            return Value::String(template.to_string());
        }

        if placeholders.len() == 1 && placeholders[0].span == (0, template.len()) {
            return match self.get(&placeholders[0].path) {
                Some(v) if is_scalar(v) => v.clone(),
                _ => Value::String(template.to_string()),
            };
        }

        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for p in &placeholders {
            out.push_str(&template[last..p.span.0]);
            match self.get(&p.path).and_then(scalar_to_string) {
                Some(text) => out.push_str(&text),
                None => out.push_str(&template[p.span.0..p.span.1]),
            }
            last = p.span.1;
        }
        out.push_str(&template[last..]);
        Value::String(out)
    }
}

// ---------------------------------------------------------------------------
// Placeholder parsing
// ---------------------------------------------------------------------------

/// A `${path}` occurrence with its byte span.
#[derive(Debug)]
struct Placeholder {
    span: (usize, usize),
    path: String,
}

fn find_placeholders(s: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(start) = s[offset..].find("${") {
        let start = offset + start;
        let Some(len) = s[start + 2..].find('}') else {
            break; // Unclosed `${`
        };
        let end = start + 2 + len + 1;
        let path = s[start + 2..end - 1].trim();
        if !path.is_empty() {
            found.push(Placeholder {
                span: (start, end),
                path: path.to_string(),
            });
        }
        offset = end;
    }
    found
}

pub(crate) fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
