//! JSON command surface for a UI shell.
//!
//! Every handler takes the shell's raw `arg0` payload and returns
//! `Result<Value, String>` so errors reach the UI as plain messages.

pub mod ledger;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Deserialize `arg0` into a payload struct, treating a missing payload as
/// an empty object.
pub(crate) fn parse_payload<T: DeserializeOwned>(
    arg0: Option<Value>,
    what: &str,
) -> Result<T, String> {
    let value = match arg0 {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(v) => v,
    };
    serde_json::from_value(value).map_err(|e| format!("Invalid {what} payload: {e}"))
}

/// Trimmed, non-empty string.
pub(crate) fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Accept either a single string or an array of strings.
pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}
