//! Structural validation for user-supplied step schemas.
//!
//! Covers the subset workflow authors actually write: `type`, `properties`,
//! `required`, `items`, and `enum`. Unknown keywords are ignored rather than
//! rejected, matching how step schemas are treated as hints, not contracts.

use serde_json::Value;

/// Validate `value` against `schema`. Returns the first violation as text.
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            return Err(format!(
                "{path}: expected {expected}, got {}",
                type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if value.get(name).is_none() {
                return Err(format!("{path}: missing required property '{name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        if let Some(object) = value.as_object() {
            for (name, prop_schema) in properties {
                if let Some(prop_value) = object.get(name) {
                    validate_at(prop_schema, prop_value, &format!("{path}.{name}"))?;
                }
            }
        }
    }

    if let Some(items) = schema.get("items") {
        if let Some(array) = value.as_array() {
            for (i, item) in array.iter().enumerate() {
                validate_at(items, item, &format!("{path}[{i}]"))?;
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_check() {
        let schema = json!({"type": "object"});
        assert!(validate(&schema, &json!({})).is_ok());
        let err = validate(&schema, &json!("nope")).unwrap_err();
        assert!(err.contains("expected object"));
    }

    #[test]
    fn test_required_properties() {
        let schema = json!({
            "type": "object",
            "required": ["summary"],
            "properties": { "summary": {"type": "string"} }
        });
        assert!(validate(&schema, &json!({"summary": "ok"})).is_ok());
        let err = validate(&schema, &json!({})).unwrap_err();
        assert!(err.contains("missing required property 'summary'"));
    }

    #[test]
    fn test_nested_property_path_in_error() {
        let schema = json!({
            "type": "object",
            "properties": { "count": {"type": "integer"} }
        });
        let err = validate(&schema, &json!({"count": "three"})).unwrap_err();
        assert!(err.contains("$.count"), "got: {err}");
    }

    #[test]
    fn test_array_items() {
        let schema = json!({"type": "array", "items": {"type": "number"}});
        assert!(validate(&schema, &json!([1, 2.5])).is_ok());
        let err = validate(&schema, &json!([1, "x"])).unwrap_err();
        assert!(err.contains("$[1]"));
    }

    #[test]
    fn test_enum() {
        let schema = json!({"enum": ["store", "search"]});
        assert!(validate(&schema, &json!("store")).is_ok());
        assert!(validate(&schema, &json!("delete")).is_err());
    }

    #[test]
    fn test_non_object_schema_accepts_anything() {
        assert!(validate(&json!(true), &json!({"x": 1})).is_ok());
    }
}
