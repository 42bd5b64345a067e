//! Restricted Lua interpreter.
//!
//! Each execution gets a fresh interpreter with only the `table`, `string`,
//! `math` and `utf8` libraries loaded, the dangerous base functions removed,
//! a memory ceiling, and an instruction hook enforcing the wall-clock
//! deadline. The input context is exposed as the `context` global; whatever
//! `context` holds after the chunk finishes is the mutated context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mlua::{
    DeserializeOptions, HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Value as LuaValue,
    VmState,
};
use serde_json::Value;
use tracing::debug;

use crate::capabilities::Capabilities;
use crate::error::{SandboxError, SandboxResult};

/// Base-library globals removed before any code runs.
const REMOVED_GLOBALS: &[&str] = &[
    "load",
    "loadstring",
    "loadfile",
    "dofile",
    "require",
    "collectgarbage",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "getmetatable",
    "setmetatable",
    "print",
];

/// Instructions between deadline checks.
const HOOK_INTERVAL: u32 = 1_000;

/// Per-execution resource limits.
#[derive(Debug, Clone)]
pub struct RuntimeLimits {
    /// Wall-clock budget.
    pub timeout: Duration,
    /// Interpreter memory ceiling in bytes.
    pub memory_limit_bytes: usize,
    /// Modules `require` may return.
    pub allowed_modules: Vec<String>,
}

pub(crate) fn deserialize_options() -> DeserializeOptions {
    DeserializeOptions::new()
        .deny_unsupported_types(false)
        .deny_recursive_tables(false)
}

/// Run `source` against `context` and return the mutated context.
///
/// Blocks the calling thread; async callers should use `spawn_blocking`.
pub fn run_chunk(
    source: &str,
    context: &Value,
    limits: &RuntimeLimits,
    capabilities: Capabilities,
) -> SandboxResult<Value> {
    let started = Instant::now();
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )
    .map_err(|e| SandboxError::RuntimeFailure(format!("Failed to create interpreter: {e}")))?;

    prepare(&lua, context, limits, capabilities)
        .map_err(|e| SandboxError::RuntimeFailure(format!("Failed to prepare interpreter: {e}")))?;

    let deadline = started + limits.timeout;
    let timed_out = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&timed_out);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                flag.store(true, Ordering::SeqCst);
                return Err(mlua::Error::runtime("execution deadline exceeded"));
            }
            Ok(VmState::Continue)
        },
    );

    let result = lua.load(source).set_name("module").exec();

    if timed_out.load(Ordering::SeqCst) {
        return Err(SandboxError::ExecutionTimeout(limits.timeout));
    }
    if let Err(e) = result {
        return Err(SandboxError::RuntimeFailure(describe_error(&e)));
    }

    let mutated: LuaValue = lua
        .globals()
        .get("context")
        .map_err(|e| SandboxError::RuntimeFailure(describe_error(&e)))?;
    let mutated: Value = lua
        .from_value_with(mutated, deserialize_options())
        .map_err(|e| SandboxError::RuntimeFailure(format!("Context is not serializable: {e}")))?;

    debug!(elapsed = ?started.elapsed(), "Chunk finished");
    Ok(mutated)
}

fn prepare(
    lua: &Lua,
    context: &Value,
    limits: &RuntimeLimits,
    capabilities: Capabilities,
) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(*name, LuaValue::Nil)?;
    }
    // Removed above; string methods would otherwise still reach it.
    let string: mlua::Table = globals.get("string")?;
    string.set("dump", LuaValue::Nil)?;

    let allowed = limits.allowed_modules.clone();
    let require = lua.create_function(move |lua, name: String| {
        if !allowed.iter().any(|m| m == &name) {
            return Err(mlua::Error::runtime(format!("module '{name}' is not allowed")));
        }
        lua.globals().get::<LuaValue>(name)
    })?;
    globals.set("require", require)?;

    capabilities.install(lua)?;
    globals.set("context", lua.to_value(context)?)?;

    lua.set_memory_limit(limits.memory_limit_bytes)?;
    Ok(())
}

/// Flatten callback chains into the innermost message.
fn describe_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => describe_error(cause),
        mlua::Error::MemoryError(_) => "memory limit exceeded".to_string(),
        mlua::Error::RuntimeError(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> RuntimeLimits {
        RuntimeLimits {
            timeout: Duration::from_secs(2),
            memory_limit_bytes: 16 * 1024 * 1024,
            allowed_modules: vec!["string".into(), "math".into()],
        }
    }

    #[test]
    fn test_mutates_context() {
        let out = run_chunk(
            "context.total = context.a + context.b\ncontext.greeting = string.upper('hi')",
            &json!({"a": 2, "b": 3}),
            &limits(),
            Capabilities::new(),
        )
        .unwrap();
        assert_eq!(out["total"], 5);
        assert_eq!(out["greeting"], "HI");
        assert_eq!(out["a"], 2);
    }

    #[test]
    fn test_replacing_context_table() {
        let out = run_chunk(
            "context = { replaced = true }",
            &json!({"old": 1}),
            &limits(),
            Capabilities::new(),
        )
        .unwrap();
        assert_eq!(out, json!({"replaced": true}));
    }

    #[test]
    fn test_runtime_error_reported() {
        let err = run_chunk("error('boom')", &json!({}), &limits(), Capabilities::new())
            .unwrap_err();
        match err {
            SandboxError::RuntimeFailure(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let limits = RuntimeLimits {
            timeout: Duration::from_millis(100),
            ..limits()
        };
        let started = Instant::now();
        let err = run_chunk("while true do end", &json!({}), &limits, Capabilities::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_memory_limit() {
        let limits = RuntimeLimits {
            memory_limit_bytes: 2 * 1024 * 1024,
            ..limits()
        };
        let err = run_chunk(
            "local t = {}\nfor i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end",
            &json!({}),
            &limits,
            Capabilities::new(),
        )
        .unwrap_err();
        match err {
            SandboxError::RuntimeFailure(msg) => assert!(msg.contains("memory")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dangerous_globals_absent() {
        let out = run_chunk(
            "context.load = type(load)\ncontext.io = type(io)\ncontext.os = type(os)\ncontext.dump = type(string.dump)",
            &json!({}),
            &limits(),
            Capabilities::new(),
        )
        .unwrap();
        assert_eq!(out["load"], "nil");
        assert_eq!(out["io"], "nil");
        assert_eq!(out["os"], "nil");
        assert_eq!(out["dump"], "nil");
    }

    #[test]
    fn test_require_respects_allow_list() {
        let out = run_chunk(
            "local m = require('math')\ncontext.pi = m.floor(m.pi)",
            &json!({}),
            &limits(),
            Capabilities::new(),
        )
        .unwrap();
        assert_eq!(out["pi"], 3);

        let err = run_chunk("require('table')", &json!({}), &limits(), Capabilities::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::RuntimeFailure(_)));
    }

    #[test]
    fn test_dispatch_capability() {
        let caps = Capabilities::new().with_dispatch(Box::new(|req| {
            json!({"success": true, "result": format!("{}:{}", req.step_type, req.params["n"]), "error": null})
        }));
        let out = run_chunk(
            "local r = foreman.dispatch('s1', 'shell', { n = 7 })\ncontext.out = r.result",
            &json!({}),
            &limits(),
            caps,
        )
        .unwrap();
        assert_eq!(out["out"], "shell:7");
    }

    #[test]
    fn test_dispatch_absent_without_grant() {
        let out = run_chunk(
            "context.has = foreman.dispatch ~= nil",
            &json!({}),
            &limits(),
            Capabilities::new(),
        )
        .unwrap();
        assert_eq!(out["has"], false);
    }

    #[test]
    fn test_json_capability() {
        let out = run_chunk(
            "local s = foreman.json.encode({ a = 1 })\ncontext.back = foreman.json.decode(s).a",
            &json!({}),
            &limits(),
            Capabilities::new(),
        )
        .unwrap();
        assert_eq!(out["back"], 1);
    }
}
