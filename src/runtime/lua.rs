//! Sandboxed Lua runtime shared by script steps and condition evaluation
//!
//! Each evaluation gets a fresh `Lua` state with the dangerous standard
//! libraries removed and a small safe API (`date`, `time`, `now`) installed.
//! All functions here are synchronous: a `Lua` value is never held across an
//! `.await`, so the callers' futures stay `Send`.

use anyhow::Result;
use mlua::{HookTriggers, Lua, LuaSerdeExt, VmState};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Heap cap for one sandbox
const MEMORY_LIMIT_BYTES: usize = 32 * 1024 * 1024;

/// Wall-clock budget of one sandbox
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(5);

/// How often the deadline is checked
const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

/// Globals removed from every sandbox
const BLOCKED_GLOBALS: &[&str] = &[
    "os", "io", "debug", "package", "require", "load", "loadfile", "dofile",
    "collectgarbage", "rawget", "rawset", "getmetatable", "setmetatable",
    // The time-limit hook only covers the main thread
    "coroutine",
];

/// Create a fresh sandboxed Lua state with the default time limit
pub fn sandbox() -> Result<Lua> {
    sandbox_with_limit(DEFAULT_TIME_LIMIT)
}

/// Create a fresh sandboxed Lua state that aborts once `limit` has elapsed
pub fn sandbox_with_limit(limit: Duration) -> Result<Lua> {
    let lua = Lua::new();
    lua.set_memory_limit(MEMORY_LIMIT_BYTES)
        .map_err(|e| anyhow::anyhow!("Failed to set Lua memory limit: {}", e))?;

    let deadline = Instant::now() + limit;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_, _| {
            if Instant::now() >= deadline {
                Err(mlua::Error::runtime(format!("Script exceeded time limit of {:?}", limit)))
            } else {
                Ok(VmState::Continue)
            }
        },
    )
    .map_err(|e| anyhow::anyhow!("Failed to install Lua time limit: {}", e))?;

    let globals = lua.globals();

    // Safe time functions (replace os.date, os.time)
    let date = lua
        .create_function(|_, format: String| Ok(chrono::Utc::now().format(&format).to_string()))
        .map_err(|e| anyhow::anyhow!("Failed to create date function: {}", e))?;
    let time = lua
        .create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))
        .map_err(|e| anyhow::anyhow!("Failed to create time function: {}", e))?;
    let now = lua
        .create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))
        .map_err(|e| anyhow::anyhow!("Failed to create now function: {}", e))?;

    for (name, function) in [("date", date), ("time", time), ("now", now)] {
        globals
            .set(name, function)
            .map_err(|e| anyhow::anyhow!("Failed to set {} function: {}", name, e))?;
    }

    for name in BLOCKED_GLOBALS {
        globals
            .set(*name, mlua::Nil)
            .map_err(|e| anyhow::anyhow!("Failed to remove Lua global {}: {}", name, e))?;
    }

    Ok(lua)
}

/// Expose a JSON value to scripts under a global name
pub fn set_global(lua: &Lua, name: &str, value: &Value) -> Result<()> {
    let lua_value = lua
        .to_value(value)
        .map_err(|e| anyhow::anyhow!("Failed to convert '{}' to Lua: {}", name, e))?;
    lua.globals()
        .set(name, lua_value)
        .map_err(|e| anyhow::anyhow!("Failed to set Lua global '{}': {}", name, e))
}

/// Whether `name` can be used as a bare Lua identifier
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Evaluate a chunk and convert its value back to JSON
pub fn eval_json(lua: &Lua, chunk: &str) -> Result<Value> {
    let result: mlua::Value = lua
        .load(chunk)
        .eval()
        .map_err(|e| anyhow::anyhow!("Lua execution failed: {}", e))?;

    match result {
        mlua::Value::Nil => Ok(Value::Null),
        other => lua
            .from_value(other)
            .map_err(|e| anyhow::anyhow!("Failed to convert Lua result to JSON: {}", e)),
    }
}

/// Evaluate a chunk for its Lua truthiness (nil, false and JSON null are false)
pub fn eval_truthy(lua: &Lua, chunk: &str) -> Result<bool> {
    let result: mlua::Value = lua
        .load(chunk)
        .eval()
        .map_err(|e| anyhow::anyhow!("Lua execution failed: {}", e))?;

    Ok(match result {
        mlua::Value::Nil | mlua::Value::Boolean(false) => false,
        mlua::Value::LightUserData(data) => !data.0.is_null(),
        _ => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blocks_dangerous_globals() {
        let lua = sandbox().unwrap();
        assert!(eval_json(&lua, "os.time()").is_err());
        assert!(eval_json(&lua, "require('io')").is_err());
        assert_eq!(eval_json(&lua, "type(time())").unwrap(), json!("number"));
    }

    #[test]
    fn runaway_loops_hit_the_time_limit() {
        let lua = sandbox_with_limit(Duration::from_millis(100)).unwrap();
        let started = Instant::now();

        let error = eval_json(&lua, "while true do end").unwrap_err();

        assert!(error.to_string().contains("time limit"), "{}", error);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn round_trips_json_through_globals() {
        let lua = sandbox().unwrap();
        set_global(&lua, "input", &json!({ "a": 2, "b": 3, "name": "x" })).unwrap();
        assert_eq!(eval_json(&lua, "input.a * input.b").unwrap(), json!(6));
        assert_eq!(eval_json(&lua, "{ total = input.a + input.b }").unwrap(), json!({ "total": 5 }));
    }

    #[test]
    fn truthiness_follows_lua_rules() {
        let lua = sandbox().unwrap();
        set_global(&lua, "missing", &Value::Null).unwrap();
        assert!(!eval_truthy(&lua, "nil").unwrap());
        assert!(!eval_truthy(&lua, "1 > 2").unwrap());
        assert!(!eval_truthy(&lua, "missing").unwrap());
        assert!(eval_truthy(&lua, "0").unwrap());
        assert!(eval_truthy(&lua, "'text'").unwrap());
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("amount_1"));
        assert!(is_identifier("_x"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
