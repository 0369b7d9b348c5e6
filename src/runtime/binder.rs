//! `${name}` placeholder substitution
//!
//! Pure string templating against a flat input map. No recursive expansion and
//! no escape syntax: a substituted value containing `${...}` stays literal.

use crate::workflow::types::DataMap;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]*)\}").expect("placeholder pattern is valid")
});

/// Replace every `${key}` in `template` with the string form of `values[key]`
///
/// Keys absent from `values` (and null values) become the empty string.
pub fn bind(template: &str, values: &DataMap) -> String {
    PLACEHOLDER
        .replace_all(template, |captures: &Captures| {
            values.get(&captures[1]).map(value_to_string).unwrap_or_default()
        })
        .into_owned()
}

/// String form of a JSON value: strings unquoted, null empty, everything else serialized
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// If `template` is exactly one placeholder, the key it names
pub fn sole_placeholder(template: &str) -> Option<&str> {
    let captures = PLACEHOLDER.captures(template)?;
    let whole = captures.get(0)?;
    if whole.start() == 0 && whole.end() == template.len() {
        captures.get(1).map(|key| key.as_str())
    } else {
        None
    }
}
