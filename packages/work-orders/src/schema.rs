//! Self-contained JSON schema validation.
//!
//! Supports the subset order types declare: `required`, `properties`, `type`
//! (single or list), `enum`, `minLength`/`maxLength`, `pattern`,
//! `minimum`/`maximum`, `minItems`/`maxItems`, and `items` (one schema for
//! all elements, or a tuple). Unknown schema keys are ignored. Validation
//! collects every error rather than stopping at the first.

use regex::Regex;
use serde_json::Value;

use crate::error::FieldError;

/// Validate `value` against `schema`, returning all field errors.
pub fn validate(schema: &Value, value: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_at(schema, value, "", &mut errors);
    errors
}

/// Convenience: validate and surface the result as `Result`.
pub fn check(schema: &Value, value: &Value) -> Result<(), Vec<FieldError>> {
    let errors = validate(schema, value);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, value) {
            errors.push(FieldError::new(
                path,
                "type",
                format!("expected type {}", type_names(expected)),
            ));
            // A value of the wrong shape would cascade noise through the
            // remaining keyword checks.
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            errors.push(FieldError::new(path, "enum", "value is not one of the allowed values"));
        }
    }

    if let Some(text) = value.as_str() {
        validate_string(schema, text, path, errors);
    }

    if value.is_number() {
        validate_number(schema, value, path, errors);
    }

    if let Some(elements) = value.as_array() {
        validate_array(schema, elements, path, errors);
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    errors.push(FieldError::new(
                        join(path, name),
                        "required",
                        "field is required",
                    ));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, subschema) in properties {
                if let Some(subvalue) = object.get(name) {
                    validate_at(subschema, subvalue, &join(path, name), errors);
                }
            }
        }
    }
}

fn validate_string(
    schema: &serde_json::Map<String, Value>,
    text: &str,
    path: &str,
    errors: &mut Vec<FieldError>,
) {
    let length = text.chars().count() as i64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_i64) {
        if length < min {
            errors.push(FieldError::new(
                path,
                "min_length",
                format!("must be at least {min} characters"),
            ));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_i64) {
        if length > max {
            errors.push(FieldError::new(
                path,
                "max_length",
                format!("must be at most {max} characters"),
            ));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        if let Ok(regex) = Regex::new(pattern) {
            if !regex.is_match(text) {
                errors.push(FieldError::new(
                    path,
                    "pattern",
                    format!("must match pattern {pattern}"),
                ));
            }
        }
    }
}

fn validate_number(
    schema: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    errors: &mut Vec<FieldError>,
) {
    let number = value.as_f64().unwrap_or(0.0);
    if let Some(minimum) = schema.get("minimum").and_then(Value::as_f64) {
        if number < minimum {
            errors.push(FieldError::new(
                path,
                "minimum",
                format!("must be >= {minimum}"),
            ));
        }
    }
    if let Some(maximum) = schema.get("maximum").and_then(Value::as_f64) {
        if number > maximum {
            errors.push(FieldError::new(
                path,
                "maximum",
                format!("must be <= {maximum}"),
            ));
        }
    }
}

fn validate_array(
    schema: &serde_json::Map<String, Value>,
    elements: &[Value],
    path: &str,
    errors: &mut Vec<FieldError>,
) {
    let count = elements.len() as i64;
    if let Some(min) = schema.get("minItems").and_then(Value::as_i64) {
        if count < min {
            errors.push(FieldError::new(
                path,
                "min_items",
                format!("must have at least {min} items"),
            ));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_i64) {
        if count > max {
            errors.push(FieldError::new(
                path,
                "max_items",
                format!("must have at most {max} items"),
            ));
        }
    }

    match schema.get("items") {
        Some(Value::Array(tuple)) => {
            for (index, (subschema, element)) in tuple.iter().zip(elements.iter()).enumerate() {
                validate_at(subschema, element, &join(path, &index.to_string()), errors);
            }
        }
        Some(subschema @ Value::Object(_)) => {
            for (index, element) in elements.iter().enumerate() {
                validate_at(subschema, element, &join(path, &index.to_string()), errors);
            }
        }
        _ => {}
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(name, value)),
        _ => true,
    }
}

fn single_type_matches(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        // Tolerate any numeric whose truncation equals itself.
        "integer" => value
            .as_f64()
            .map(|n| n.trunc() == n && n.is_finite())
            .unwrap_or(false),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_names(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        _ => "any".to_string(),
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}
