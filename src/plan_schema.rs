//! The Plan DSL's published JSON Schema (Draft-7) and structural
//! validation. This is the wire format between the LLM adapter
//! and the validator: every plan must validate against this schema
//! before semantic checks (`validator.rs`) run.

use std::sync::OnceLock;

use serde_json::{json, Value};

use crate::model::ValidationError;

/// The published Plan DSL schema, `additionalProperties: false` throughout.
pub fn plan_dsl_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "required": ["version", "intent", "metric_id", "join_path_id", "output", "confidence"],
            "properties": {
                "version": { "const": "1.0" },
                "intent": { "enum": ["trend", "aggregate", "rank", "compare", "detail"] },
                "metric_id": { "type": "string", "minLength": 1 },
                "metric_params": { "type": "object" },
                "dimensions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["table", "field"],
                        "properties": {
                            "table": { "type": "string" },
                            "field": { "type": "string" }
                        }
                    }
                },
                "time_range": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["start", "end"],
                    "properties": {
                        "start": { "type": "string" },
                        "end": { "type": "string" }
                    }
                },
                "time_grain": { "enum": ["15m", "hour", "day", "week", "month"] },
                "filters": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["table", "field", "op", "value"],
                        "properties": {
                            "table": { "type": "string" },
                            "field": { "type": "string" },
                            "op": { "enum": ["=", "!=", ">", ">=", "<", "<=", "in", "like", "between"] },
                            "value": {}
                        }
                    }
                },
                "join_path_id": { "type": "string", "minLength": 1 },
                "sort": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["by", "order"],
                    "properties": {
                        "by": { "type": "string" },
                        "order": { "enum": ["asc", "desc"] }
                    }
                },
                "limit": { "type": "integer", "minimum": 1, "maximum": 10000 },
                "output": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["format", "chart_suggest"],
                    "properties": {
                        "format": { "enum": ["table", "single_value"] },
                        "chart_suggest": { "enum": ["line", "bar", "heatmap", "none"] }
                    }
                },
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                "clarifications": { "type": "array", "items": { "type": "string" } },
                "errors_unresolved": { "type": "array", "items": { "type": "string" } }
            }
        })
    })
}

fn validator() -> &'static jsonschema::Validator {
    static VALIDATOR: OnceLock<jsonschema::Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        jsonschema::options()
            .with_draft(jsonschema::Draft::Draft7)
            .build(plan_dsl_schema())
            .expect("static plan DSL schema compiles")
    })
}

/// Dot-joined JSON pointer, `$` for the document root.
fn dotted_path(instance_path: &str) -> String {
    let trimmed = instance_path.trim_start_matches('/');
    if trimmed.is_empty() { "$".to_string() } else { trimmed.replace('/', ".") }
}

/// Validate `plan` against the Plan DSL JSON Schema. An empty result means
/// the plan is structurally well-formed; messages are verbatim from the
/// schema engine.
pub fn validate_schema(plan: &Value) -> Vec<ValidationError> {
    if !plan.is_object() {
        return vec![ValidationError::new("not_json", "plan is not a JSON object", "$")];
    }
    validator()
        .iter_errors(plan)
        .map(|err| {
            let field_path = dotted_path(&err.instance_path.to_string());
            ValidationError::new("schema", err.to_string(), field_path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_plan_is_rejected_with_schema_errors() {
        let plan = json!({"version": "1.0"});
        let errors = validate_schema(&plan);
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.code == "schema"));
    }

    #[test]
    fn non_object_plan_is_not_json() {
        let plan = json!("SELECT * FROM t");
        let errors = validate_schema(&plan);
        assert_eq!(errors[0].code, "not_json");
    }

    #[test]
    fn well_formed_plan_validates_clean() {
        let plan = json!({
            "version": "1.0",
            "intent": "trend",
            "metric_id": "load_rate",
            "dimensions": [],
            "time_range": {"start": "2024-01-01", "end": "2024-01-31"},
            "time_grain": "day",
            "filters": [],
            "join_path_id": "NONE",
            "output": {"format": "table", "chart_suggest": "line"},
            "confidence": 0.8,
            "clarifications": []
        });
        assert!(validate_schema(&plan).is_empty());
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let plan = json!({
            "version": "1.0",
            "intent": "trend",
            "metric_id": "load_rate",
            "join_path_id": "NONE",
            "output": {"format": "table", "chart_suggest": "line"},
            "confidence": 0.8,
            "bogus_field": true
        });
        assert!(!validate_schema(&plan).is_empty());
    }
}
