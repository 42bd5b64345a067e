//! The capability object handed to generated code.
//!
//! Generated code sees a single `foreman` global enumerating exactly what it
//! may do:
//!
//! | Function | Purpose |
//! |----------|---------|
//! | `foreman.log(msg)` | emit a log line |
//! | `foreman.now()` | seconds since the Unix epoch |
//! | `foreman.json.encode(v)` / `foreman.json.decode(s)` | JSON conversion |
//! | `foreman.dispatch(step_id, step_type, params)` | run a step through the host's runners |
//!
//! `dispatch` is only present when the host grants it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use mlua::{Lua, LuaSerdeExt, Value as LuaValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from generated code to run one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub step_id: String,
    pub step_type: String,
    #[serde(default)]
    pub params: Value,
}

/// Host-side handler for `foreman.dispatch`.
///
/// The returned value is handed back to the generated code as-is; by
/// convention it is a step outcome object (`{success, result, error, status}`).
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Value;
}

/// Synchronous dispatch hook installed into the interpreter.
pub type DispatchFn = Box<dyn Fn(DispatchRequest) -> Value + Send + 'static>;

/// Outcome reported to generated code when dispatch is not granted or fails.
pub fn dispatch_unavailable(reason: &str) -> Value {
    serde_json::json!({
        "success": false,
        "result": null,
        "error": reason,
        "status": "failed",
    })
}

/// The set of host operations granted to one execution.
#[derive(Default)]
pub struct Capabilities {
    dispatch: Option<DispatchFn>,
}

impl Capabilities {
    /// Capabilities without step dispatch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `foreman.dispatch` backed by `f`.
    pub fn with_dispatch(mut self, f: DispatchFn) -> Self {
        self.dispatch = Some(f);
        self
    }

    /// Grant `foreman.dispatch` backed by an async dispatcher.
    ///
    /// Must be called from within a Tokio runtime; the interpreter itself
    /// must then run on a blocking thread.
    pub fn with_async_dispatcher(self, dispatcher: Arc<dyn StepDispatcher>) -> Self {
        let handle = tokio::runtime::Handle::current();
        self.with_dispatch(Box::new(move |request| {
            handle.block_on(dispatcher.dispatch(request))
        }))
    }

    /// Whether dispatch was granted.
    pub fn can_dispatch(&self) -> bool {
        self.dispatch.is_some()
    }

    /// Install the `foreman` table into `lua`'s globals.
    pub(crate) fn install(self, lua: &Lua) -> mlua::Result<()> {
        let foreman = lua.create_table()?;

        let log = lua.create_function(|_, message: String| {
            tracing::info!(target: "foreman_sandbox::script", "{message}");
            Ok(())
        })?;
        foreman.set("log", log)?;

        let now = lua.create_function(|_, ()| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            Ok(secs)
        })?;
        foreman.set("now", now)?;

        let json = lua.create_table()?;
        let encode = lua.create_function(|lua, value: LuaValue| {
            let value: Value = lua.from_value_with(value, crate::runtime::deserialize_options())?;
            serde_json::to_string(&value).map_err(mlua::Error::external)
        })?;
        let decode = lua.create_function(|lua, text: String| {
            let value: Value = serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value(&value)
        })?;
        json.set("encode", encode)?;
        json.set("decode", decode)?;
        foreman.set("json", json)?;

        if let Some(dispatch) = self.dispatch {
            let f = lua.create_function(
                move |lua, (step_id, step_type, params): (String, String, Option<LuaValue>)| {
                    let params: Value = match params {
                        Some(p) => lua.from_value_with(p, crate::runtime::deserialize_options())?,
                        None => Value::Null,
                    };
                    let outcome = dispatch(DispatchRequest {
                        step_id,
                        step_type,
                        params,
                    });
                    lua.to_value(&outcome)
                },
            )?;
            foreman.set("dispatch", f)?;
        }

        lua.globals().set("foreman", foreman)?;
        Ok(())
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("dispatch", &self.dispatch.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_request_defaults_params() {
        let req: DispatchRequest =
            serde_json::from_str(r#"{"step_id": "a", "step_type": "shell"}"#).unwrap();
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn test_dispatch_unavailable_shape() {
        let outcome = dispatch_unavailable("nope");
        assert_eq!(outcome["success"], false);
        assert_eq!(outcome["error"], "nope");
        assert_eq!(outcome["status"], "failed");
    }

    #[test]
    fn test_capabilities_debug_hides_closure() {
        let caps = Capabilities::new().with_dispatch(Box::new(|_| Value::Null));
        assert!(caps.can_dispatch());
        assert!(format!("{caps:?}").contains("dispatch: true"));
    }
}
