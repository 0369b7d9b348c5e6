//! Pluggable condition evaluation for branch steps and guarded connections

use crate::runtime::{binder, lua};
use crate::workflow::types::{Condition, DataMap};
use anyhow::Result;
use serde_json::Value;

/// Decides whether a condition holds for the current input data
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &Condition, input: &DataMap) -> Result<bool>;
}

/// Resolve a condition's variables against the input
///
/// A variable whose value is exactly `"${key}"` takes the raw input value (type
/// preserved); other strings are bound as templates; non-strings pass through.
pub fn resolve_variables(condition: &Condition, input: &DataMap) -> DataMap {
    condition
        .variables
        .iter()
        .map(|(name, value)| {
            let resolved = match value {
                Value::String(template) => match binder::sole_placeholder(template) {
                    Some(key) => input.get(key).cloned().unwrap_or(Value::Null),
                    None => Value::String(binder::bind(template, input)),
                },
                other => other.clone(),
            };
            (name.clone(), resolved)
        })
        .collect()
}

/// Evaluates expressions as Lua in a fresh sandbox
///
/// Input entries with identifier-safe keys become globals, the whole input is
/// also available as `input`, and resolved variables are set last so they
/// shadow input keys. An empty expression is always true.
#[derive(Debug, Default, Clone, Copy)]
pub struct LuaConditionEvaluator;

impl ConditionEvaluator for LuaConditionEvaluator {
    fn evaluate(&self, condition: &Condition, input: &DataMap) -> Result<bool> {
        let expression = condition.expression.trim();
        if expression.is_empty() {
            return Ok(true);
        }

        let lua = lua::sandbox()?;
        lua::set_global(&lua, "input", &Value::Object(input.clone()))?;
        for (key, value) in input.iter().filter(|(key, _)| lua::is_identifier(key)) {
            lua::set_global(&lua, key, value)?;
        }
        for (name, value) in resolve_variables(condition, input) {
            if lua::is_identifier(&name) {
                lua::set_global(&lua, &name, &value)?;
            } else {
                tracing::warn!("⚠️ Ignoring condition variable with invalid name: {}", name);
            }
        }

        let result = lua::eval_truthy(&lua, expression)?;
        tracing::debug!("🔀 Condition '{}' evaluated to {}", expression, result);
        Ok(result)
    }
}
