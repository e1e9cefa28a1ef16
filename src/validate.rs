use serde_json::{json, Map, Value};

use crate::envelope::{ErrorCode, ToolError};
use crate::registry::{ArgSchema, ArgType};
use crate::types::CallContext;

/// Checks raw caller arguments against a tool schema and produces the
/// canonical argument object the handler will see.
///
/// Order of operations: reject unknown keys, canonicalize aliases, fill
/// context defaults and declared defaults for omitted fields, then coerce
/// each field to its declared type. Handlers never see unknown keys.
pub fn validate_args(
    schema: &ArgSchema,
    raw: &Value,
    ctx: &CallContext,
) -> Result<Value, ToolError> {
    let raw_map = match raw {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(ToolError::new(
                ErrorCode::ValidationError,
                format!("arguments must be an object, got {}", type_name(other)),
            ))
        }
    };

    if !schema.allow_extra {
        let allowed = schema.allowed_names();
        let unknown: Vec<&str> = raw_map
            .keys()
            .map(String::as_str)
            .filter(|k| !allowed.contains(k))
            .collect();
        if !unknown.is_empty() {
            return Err(ToolError::new(
                ErrorCode::ValidationError,
                format!("unknown arguments: {}", unknown.join(", ")),
            )
            .with_details(json!({ "unknown_args": unknown })));
        }
    }

    let mut out = Map::new();
    let mut missing: Vec<&str> = Vec::new();

    for field in &schema.fields {
        // Canonical name wins when the caller supplies both it and an alias.
        let supplied = raw_map.get(&field.name).cloned().or_else(|| {
            field
                .aliases
                .iter()
                .find_map(|alias| raw_map.get(alias).cloned())
        });

        let value = match supplied {
            Some(v) => Some(v),
            None => context_default(&field.name, ctx)
                .or_else(|| field.default.clone()),
        };

        match value {
            Some(v) => {
                let coerced = coerce(&v, field.arg_type).ok_or_else(|| {
                    ToolError::new(
                        ErrorCode::ValidationError,
                        format!(
                            "invalid type for {}: expected {}, got {}",
                            field.name,
                            field.arg_type.label(),
                            type_name(&v)
                        ),
                    )
                    .with_details(json!({
                        "field": field.name,
                        "expected": field.arg_type.label(),
                        "got": type_name(&v),
                    }))
                })?;
                out.insert(field.name.clone(), coerced);
            }
            None if field.required => missing.push(field.name.as_str()),
            None => {}
        }
    }

    if !missing.is_empty() {
        return Err(ToolError::new(
            ErrorCode::ValidationError,
            format!("missing required arguments: {}", missing.join(", ")),
        )
        .with_details(json!({ "missing_args": missing })));
    }

    if schema.allow_extra {
        let declared = schema.allowed_names();
        for (k, v) in &raw_map {
            if !declared.contains(k.as_str()) {
                out.insert(k.clone(), v.clone());
            }
        }
    }

    Ok(Value::Object(out))
}

/// Context fields back-fill matching schema fields the caller omitted.
/// Caller-supplied values are never overwritten.
fn context_default(field_name: &str, ctx: &CallContext) -> Option<Value> {
    let value = match field_name {
        "project_id" => &ctx.project_id,
        "branch" => &ctx.branch,
        "user_id" => &ctx.user_id,
        _ => return None,
    };
    if value.is_empty() {
        None
    } else {
        Some(Value::String(value.clone()))
    }
}

fn coerce(value: &Value, arg_type: ArgType) -> Option<Value> {
    match arg_type {
        ArgType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        ArgType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
            Value::Number(n) => {
                let f = n.as_f64()?;
                if f.fract() == 0.0 {
                    Some(json!(f as i64))
                } else {
                    None
                }
            }
            Value::String(s) => s.trim().parse::<i64>().ok().map(|i| json!(i)),
            _ => None,
        },
        ArgType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| json!(f)),
            _ => None,
        },
        ArgType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(json!(true)),
                "false" | "0" | "no" => Some(json!(false)),
                _ => None,
            },
            _ => None,
        },
        ArgType::Array => match value {
            Value::Array(_) => Some(value.clone()),
            _ => None,
        },
        ArgType::Object => match value {
            Value::Object(_) => Some(value.clone()),
            _ => None,
        },
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
    use serde_json::json;

    use super::*;
    use crate::registry::{ArgField, ArgSchema, ArgType};
    use crate::types::CallContext;

    fn ctx() -> CallContext {
        CallContext::new(
            "proj-1",
            "main",
            "dev@example.com",
            "conv-1",
            crate::policy::ToolPolicy::default(),
        )
    }

    fn grep_schema() -> ArgSchema {
        ArgSchema::new(vec![
            ArgField::required("pattern", ArgType::String, "Pattern."),
            ArgField::optional("max_results", ArgType::Integer, "Cap.").with_default(json!(50)),
            ArgField::optional("project_id", ArgType::String, "Project."),
        ])
    }

    #[test]
    fn unknown_keys_are_listed_exactly() {
        let err = validate_args(
            &grep_schema(),
            &json!({"pattern": "fn main", "foo": 1, "bar": 2}),
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        let mut unknown: Vec<String> = serde_json::from_value(
            err.details.unwrap()["unknown_args"].clone(),
        )
        .unwrap();
        unknown.sort();
        assert_eq!(unknown, ["bar", "foo"]);
    }

    #[test]
    fn context_defaults_fill_only_omitted_fields() {
        let out = validate_args(&grep_schema(), &json!({"pattern": "x"}), &ctx()).unwrap();
        assert_eq!(out["project_id"], "proj-1");
        assert_eq!(out["max_results"], 50);

        let out = validate_args(
            &grep_schema(),
            &json!({"pattern": "x", "project_id": "other"}),
            &ctx(),
        )
        .unwrap();
        assert_eq!(out["project_id"], "other");
    }

    #[test]
    fn aliases_canonicalize_to_field_name() {
        let schema = ArgSchema::new(vec![ArgField::required(
            "file_path",
            ArgType::String,
            "Path.",
        )
        .with_alias("path")]);
        let out = validate_args(&schema, &json!({"path": "src/main.rs"}), &ctx()).unwrap();
        assert_eq!(out["file_path"], "src/main.rs");
        assert!(out.get("path").is_none());
    }

    #[test]
    fn type_coercion_accepts_numeric_strings_and_rejects_garbage() {
        let out = validate_args(
            &grep_schema(),
            &json!({"pattern": "x", "max_results": "25"}),
            &ctx(),
        )
        .unwrap();
        assert_eq!(out["max_results"], 25);

        let err = validate_args(
            &grep_schema(),
            &json!({"pattern": "x", "max_results": "lots"}),
            &ctx(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(err.details.unwrap()["field"], "max_results");
    }

    #[test]
    fn missing_required_fields_fail() {
        let err = validate_args(&grep_schema(), &json!({}), &ctx()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(err.details.unwrap()["missing_args"], json!(["pattern"]));
    }

    #[test]
    fn allow_extra_passes_undeclared_keys_through() {
        let schema = ArgSchema::new(vec![ArgField::required(
            "name",
            ArgType::String,
            "Name.",
        )])
        .allowing_extra();
        let out =
            validate_args(&schema, &json!({"name": "n", "anything": [1, 2]}), &ctx()).unwrap();
        assert_eq!(out["anything"], json!([1, 2]));
    }
}
