//! Structured-output schema support: a JSON-Schema subset validator,
//! the formatter system prompt, and the native strict-schema payload.
//!
//! Supported keywords: `type` (`object`, `array`, `string`, `number`,
//! `integer`, `boolean`), `properties`, `items`, `required`, `enum`,
//! `description`. Numbers accept any numeric kind.

use serde_json::{json, Value};

/// Validate `value` against the schema subset. Returns every violation
/// found, with JSON-path locations; empty means valid.
pub fn validate(value: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_at("$", value, schema, &mut errors);
    errors
}

fn validate_at(path: &str, value: &Value, schema: &Value, errors: &mut Vec<String>) {
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            errors.push(format!(
                "{}: value {} is not one of the allowed enum options",
                path, value
            ));
        }
        return;
    }

    let Some(expected) = schema.get("type").and_then(Value::as_str) else {
        // No type constraint: nothing to check at this level.
        return;
    };

    match expected {
        "object" => {
            let Value::Object(map) = value else {
                errors.push(type_error(path, "object", value));
                return;
            };
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(key) {
                        errors.push(format!("{}: missing required property '{}'", path, key));
                    }
                }
            }
            if let Some(Value::Object(properties)) = schema.get("properties") {
                for (key, property_schema) in properties {
                    if let Some(child) = map.get(key) {
                        validate_at(&format!("{}.{}", path, key), child, property_schema, errors);
                    }
                }
            }
        }
        "array" => {
            let Value::Array(items) = value else {
                errors.push(type_error(path, "array", value));
                return;
            };
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_at(&format!("{}[{}]", path, i), item, item_schema, errors);
                }
            }
        }
        "string" => {
            if !value.is_string() {
                errors.push(type_error(path, "string", value));
            }
        }
        "number" | "integer" => {
            if !value.is_number() {
                errors.push(type_error(path, expected, value));
            }
        }
        "boolean" => {
            if !value.is_boolean() {
                errors.push(type_error(path, "boolean", value));
            }
        }
        other => {
            errors.push(format!("{}: unsupported schema type '{}'", path, other));
        }
    }
}

fn type_error(path: &str, expected: &str, value: &Value) -> String {
    let actual = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("{}: expected {}, got {}", path, expected, actual)
}

/// System prompt for the dedicated formatting call: enumerates schema
/// fields and demands JSON that matches them exactly.
pub fn formatter_system_prompt(schema: &Value) -> String {
    let mut prompt = String::from(
        "You are a formatting assistant. Convert the given content into a \
         single JSON object matching this exact structure. Respond with \
         JSON only: no prose, no code fences.\n\nFields:\n",
    );
    describe_fields(schema, "", &mut prompt);
    prompt.push_str("\nEvery required field must be present. Do not invent fields.");
    prompt
}

fn describe_fields(schema: &Value, indent: &str, out: &mut String) {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(Value::Object(properties)) = schema.get("properties") else {
        return;
    };
    for (name, property) in properties {
        let type_name = property
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("any");
        let description = property
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        let marker = if required.contains(&name.as_str()) {
            " (required)"
        } else {
            ""
        };
        out.push_str(&format!(
            "{}- {} [{}]{}{}{}\n",
            indent,
            name,
            type_name,
            marker,
            if description.is_empty() { "" } else { ": " },
            description
        ));
        if type_name == "object" {
            describe_fields(property, &format!("{}  ", indent), out);
        } else if type_name == "array" {
            if let Some(items) = property.get("items") {
                if items.get("type").and_then(Value::as_str) == Some("object") {
                    describe_fields(items, &format!("{}  ", indent), out);
                }
            }
        }
    }
}

/// Native strict-schema `response_format` payload for compliant models.
pub fn response_format(schema: &Value) -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "block_output",
            "strict": true,
            "schema": schema,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["title", "score"],
            "properties": {
                "title": {"type": "string", "description": "Short headline"},
                "score": {"type": "number"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "verdict": {"enum": ["pass", "fail"]},
                "meta": {
                    "type": "object",
                    "properties": {"source": {"type": "string"}}
                }
            }
        })
    }

    #[test]
    fn test_valid_object_passes() {
        let value = json!({
            "title": "ok",
            "score": 0.8,
            "tags": ["a"],
            "verdict": "pass",
            "meta": {"source": "x"}
        });
        assert!(validate(&value, &schema()).is_empty());
    }

    #[test]
    fn test_missing_required_reported() {
        let errors = validate(&json!({"title": "ok"}), &schema());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("missing required property 'score'"));
    }

    #[test]
    fn test_wrong_types_reported_with_paths() {
        let value = json!({"title": 5, "score": "high", "tags": ["a", 2]});
        let errors = validate(&value, &schema());
        assert!(errors.iter().any(|e| e.contains("$.title")));
        assert!(errors.iter().any(|e| e.contains("$.score")));
        assert!(errors.iter().any(|e| e.contains("$.tags[1]")));
    }

    #[test]
    fn test_integer_accepts_any_numeric() {
        let schema = json!({"type": "integer"});
        assert!(validate(&json!(3), &schema).is_empty());
        assert!(validate(&json!(3.9), &schema).is_empty());
        assert!(!validate(&json!("3"), &schema).is_empty());
    }

    #[test]
    fn test_enum_violation() {
        let errors = validate(
            &json!({"title": "t", "score": 1, "verdict": "maybe"}),
            &schema(),
        );
        assert!(errors.iter().any(|e| e.contains("enum")));
    }

    #[test]
    fn test_unknown_properties_ignored() {
        let value = json!({"title": "t", "score": 1, "surprise": true});
        assert!(validate(&value, &schema()).is_empty());
    }

    #[test]
    fn test_formatter_prompt_enumerates_fields() {
        let prompt = formatter_system_prompt(&schema());
        assert!(prompt.contains("- title [string] (required): Short headline"));
        assert!(prompt.contains("- score [number] (required)"));
        assert!(prompt.contains("- tags [array]"));
        assert!(prompt.contains("  - source [string]"));
        assert!(prompt.contains("JSON only"));
    }

    #[test]
    fn test_response_format_shape() {
        let format = response_format(&schema());
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["strict"], true);
        assert!(format["json_schema"]["schema"]["properties"].is_object());
    }
}
