//! Minimal structural validator for agent result objects.
//!
//! Supports the subset of JSON Schema the phase result schemas use: `object`
//! (with `properties`, `required`, `additionalProperties`), `array` (with
//! `items`), `string`, `boolean` and `integer`. Any other or absent `type`
//! accepts every value.

use std::collections::BTreeMap;

use serde_json::Value;

/// Lowered schema node.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Object {
        properties: BTreeMap<String, Schema>,
        required: Vec<String>,
        additional_allowed: bool,
    },
    Array {
        items: Option<Box<Schema>>,
    },
    String,
    Boolean,
    Integer,
    Any,
}

impl Schema {
    /// Lower a JSON Schema document into a [`Schema`]. Never fails: shapes it
    /// does not understand become [`Schema::Any`].
    pub fn from_value(schema: &Value) -> Self {
        let kind = schema.get("type").and_then(Value::as_str);
        match kind {
            Some("object") => {
                let properties = schema
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(key, sub)| (key.clone(), Schema::from_value(sub)))
                            .collect()
                    })
                    .unwrap_or_default();
                let required = schema
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|keys| {
                        keys.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let additional_allowed = schema
                    .get("additionalProperties")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Schema::Object {
                    properties,
                    required,
                    additional_allowed,
                }
            }
            Some("array") => Schema::Array {
                items: schema
                    .get("items")
                    .map(|items| Box::new(Schema::from_value(items))),
            },
            Some("string") => Schema::String,
            Some("boolean") => Schema::Boolean,
            Some("integer") => Schema::Integer,
            _ => Schema::Any,
        }
    }

    /// Validate `value`, returning every violation found. Empty means valid.
    pub fn validate(&self, value: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        self.validate_at(value, "$", &mut errors);
        errors
    }

    fn validate_at(&self, value: &Value, path: &str, errors: &mut Vec<String>) {
        if !self.matches_type(value) {
            errors.push(format!(
                "{path}: expected {}, got {}",
                self.type_name(),
                kind_of(value)
            ));
            return;
        }

        match (self, value) {
            (
                Schema::Object {
                    properties,
                    required,
                    additional_allowed,
                },
                Value::Object(map),
            ) => {
                for key in required {
                    if !map.contains_key(key) {
                        errors.push(format!("{path}.{key}: missing required field"));
                    }
                }
                for (key, child) in map {
                    match properties.get(key) {
                        Some(sub) => sub.validate_at(child, &format!("{path}.{key}"), errors),
                        None if !additional_allowed => {
                            errors.push(format!("{path}.{key}: additional property not allowed"));
                        }
                        None => {}
                    }
                }
            }
            (Schema::Array { items: Some(items) }, Value::Array(elements)) => {
                for (idx, element) in elements.iter().enumerate() {
                    items.validate_at(element, &format!("{path}[{idx}]"), errors);
                }
            }
            _ => {}
        }
    }

    fn matches_type(&self, value: &Value) -> bool {
        match self {
            Schema::Object { .. } => value.is_object(),
            Schema::Array { .. } => value.is_array(),
            Schema::String => value.is_string(),
            Schema::Boolean => value.is_boolean(),
            // `Value::Bool` is never a number, so booleans are rejected here.
            Schema::Integer => value.is_i64() || value.is_u64(),
            Schema::Any => true,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Schema::Object { .. } => "object",
            Schema::Array { .. } => "array",
            Schema::String => "string",
            Schema::Boolean => "boolean",
            Schema::Integer => "integer",
            Schema::Any => "any",
        }
    }
}

/// Validate `value` against a raw JSON Schema document.
pub fn validate(value: &Value, schema: &Value) -> Vec<String> {
    Schema::from_value(schema).validate(value)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
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

    fn judge_schema() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["pass", "problems"],
            "properties": {
                "pass": {"type": "boolean"},
                "problems": {"type": "array", "items": {"type": "string"}},
                "blocking": {"type": "boolean"},
                "summary": {"type": "string"}
            }
        })
    }

    #[test]
    fn valid_object_has_no_errors() {
        let value = json!({"pass": true, "problems": [], "summary": "ok"});
        assert!(validate(&value, &judge_schema()).is_empty());
    }

    #[test]
    fn reports_missing_required_fields() {
        let errors = validate(&json!({"summary": "x"}), &judge_schema());
        assert_eq!(
            errors,
            vec![
                "$.pass: missing required field".to_string(),
                "$.problems: missing required field".to_string(),
            ]
        );
    }

    #[test]
    fn rejects_additional_properties_when_disallowed() {
        let value = json!({"pass": true, "problems": [], "extra": 1});
        let errors = validate(&value, &judge_schema());
        assert_eq!(errors, vec!["$.extra: additional property not allowed"]);
    }

    #[test]
    fn allows_additional_properties_by_default() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        assert!(validate(&json!({"a": "x", "b": 2}), &schema).is_empty());
    }

    #[test]
    fn recurses_into_array_items() {
        let value = json!({"pass": false, "problems": ["ok", 3]});
        let errors = validate(&value, &judge_schema());
        assert_eq!(errors, vec!["$.problems[1]: expected string, got integer"]);
    }

    #[test]
    fn integer_rejects_booleans_and_fractions() {
        let schema = json!({"type": "integer"});
        assert!(validate(&json!(3), &schema).is_empty());
        assert_eq!(
            validate(&json!(true), &schema),
            vec!["$: expected integer, got boolean"]
        );
        assert_eq!(
            validate(&json!(1.5), &schema),
            vec!["$: expected integer, got number"]
        );
    }

    #[test]
    fn unknown_or_missing_type_accepts_anything() {
        assert!(validate(&json!(null), &json!({})).is_empty());
        assert!(validate(&json!([1, "a"]), &json!({"type": "number"})).is_empty());
    }

    #[test]
    fn type_mismatch_stops_descent() {
        let errors = validate(&json!(["not", "object"]), &judge_schema());
        assert_eq!(errors, vec!["$: expected object, got array"]);
    }

    #[test]
    fn validation_is_idempotent() {
        let schema = judge_schema();
        let valid = json!({"pass": true, "problems": []});
        assert!(validate(&valid, &schema).is_empty());
        assert!(validate(&valid, &schema).is_empty());

        let invalid = json!({"pass": "yes", "extra": true});
        assert_eq!(validate(&invalid, &schema), validate(&invalid, &schema));
        assert_eq!(validate(&invalid, &schema).len(), 3);
    }
}
