//! Layered merge of raw config documents

use std::collections::HashSet;

use serde_json::{Map, Value};

/// Top-level key naming a base config (string or list of strings)
pub const EXTENDS_KEY: &str = "extends";

/// Top-level key listing dotted paths whose arrays replace instead of concatenate
pub const OVERRIDES_KEY: &str = "overrides";

/// Merge `child` over `base`.
///
/// Objects merge key by key, arrays concatenate (parent first) unless the
/// child lists the array's dotted path under `overrides`, and everything
/// else is replaced by the child's value. The `overrides` directive is
/// consumed and never appears in the result.
pub fn merge(base: Value, mut child: Value) -> Value {
    let overrides = take_overrides(&mut child);
    merge_at(base, child, "", &overrides)
}

/// An empty mapping, the identity for `merge`
pub fn empty() -> Value {
    Value::Object(Map::new())
}

fn take_overrides(child: &mut Value) -> HashSet<String> {
    let Some(directive) = child.as_object_mut().and_then(|m| m.remove(OVERRIDES_KEY)) else {
        return HashSet::new();
    };

    match directive {
        Value::String(path) => HashSet::from([path]),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(String::from))
            .collect(),
        _ => HashSet::new(),
    }
}

fn merge_at(base: Value, child: Value, path: &str, overrides: &HashSet<String>) -> Value {
    match (base, child) {
        (Value::Object(mut base), Value::Object(child)) => {
            for (key, value) in child {
                let key_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                let merged = match base.remove(&key) {
                    Some(existing) => merge_at(existing, value, &key_path, overrides),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (Value::Array(mut base), Value::Array(child)) if !overrides.contains(path) => {
            base.extend(child);
            Value::Array(base)
        }
        (_, child) => child,
    }
}
