//! Layer merging
//!
//! - Objects: deep-merge by key
//! - Arrays: REPLACE (last wins)
//! - Scalars: override (last wins)
//!
//! CLI overrides arrive as dotted `key=value` assignments and are turned into
//! a nested overlay before merging.

use serde_json::{Map, Value};

use super::effective::ConfigError;

/// Deep merge `overlay` onto `base`
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Merge layers in order; the last layer has the highest precedence
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Parse `a.b.c=value` into a path and a JSON value
///
/// The value is read as JSON when it parses (`30`, `true`, `["x"]`) and as a
/// plain string otherwise.
pub fn parse_assignment(assignment: &str) -> Result<(String, Value), ConfigError> {
    let (path, raw) = assignment
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(assignment.to_string()))?;
    let path = path.trim();
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(ConfigError::InvalidOverride(assignment.to_string()));
    }

    let raw = raw.trim();
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((path.to_string(), value))
}

/// Set `value` at dotted `path`, creating intermediate objects
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut parts = path.split('.').peekable();

    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Build one overlay from a list of dotted assignments
pub fn overlay_from_assignments<S: AsRef<str>>(assignments: &[S]) -> Result<Value, ConfigError> {
    let mut overlay = Value::Object(Map::new());
    for assignment in assignments {
        let (path, value) = parse_assignment(assignment.as_ref())?;
        set_path(&mut overlay, &path, value);
    }
    Ok(overlay)
}
