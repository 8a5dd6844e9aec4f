//! Field-mapping projection: a route's `field_mapping`
//! names, for each destination field, a dot-path into the event payload (or
//! a literal if the path starts with `=`). Absent `field_mapping` passes
//! the payload through unchanged.

use serde_json::Value;

/// Project `payload` through `field_mapping` into the shape a destination
/// adapter expects. `field_mapping` is a JSON object of
/// `{dest_field: "dot.path.into.payload"}` or `{dest_field: "=literal"}`.
pub fn apply_field_mapping(field_mapping: Option<&Value>, payload: &Value) -> Value {
    let Some(mapping) = field_mapping.and_then(|v| v.as_object()) else {
        return payload.clone();
    };

    let mut out = serde_json::Map::new();
    for (dest_field, source) in mapping {
        let Some(path) = source.as_str() else {
            out.insert(dest_field.clone(), source.clone());
            continue;
        };
        if let Some(literal) = path.strip_prefix('=') {
            out.insert(dest_field.clone(), Value::String(literal.to_string()));
        } else {
            out.insert(dest_field.clone(), resolve_path(payload, path).cloned().unwrap_or(Value::Null));
        }
    }
    Value::Object(out)
}

fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, segment| v.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_mapping_passes_payload_through() {
        let payload = serde_json::json!({"a": 1});
        assert_eq!(apply_field_mapping(None, &payload), payload);
    }

    #[test]
    fn dot_path_resolves_nested_field() {
        let mapping = serde_json::json!({"title": "task.title"});
        let payload = serde_json::json!({"task": {"title": "Fix bug"}});
        let out = apply_field_mapping(Some(&mapping), &payload);
        assert_eq!(out["title"], "Fix bug");
    }

    #[test]
    fn literal_prefix_passes_through_verbatim() {
        let mapping = serde_json::json!({"channel": "=#alerts"});
        let out = apply_field_mapping(Some(&mapping), &serde_json::json!({}));
        assert_eq!(out["channel"], "#alerts");
    }

    #[test]
    fn missing_path_resolves_to_null() {
        let mapping = serde_json::json!({"missing": "a.b.c"});
        let out = apply_field_mapping(Some(&mapping), &serde_json::json!({"a": {}}));
        assert_eq!(out["missing"], Value::Null);
    }
}
