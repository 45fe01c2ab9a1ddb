//! The Semantic Validator. Pure and side-effect free: given a
//! candidate plan and an evidence bundle it returns a vector of errors.
//! Running it twice on the same inputs must produce identical results,
//! which falls out of taking only shared references and never mutating
//! its inputs.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, info};

use crate::model::{EvidenceBundle, Intent, PlanDsl, ValidationError};
use crate::plan_schema::validate_schema;

const REQUIRED_AGG_FOR_KNOWN_METRIC: &str = "sum";

pub struct SemanticValidator;

impl SemanticValidator {
    pub fn new() -> Self {
        Self
    }

    /// Run the full validation pass over a candidate plan. An empty result
    /// means accept.
    pub fn validate(&self, plan: &Value, evidence: &EvidenceBundle) -> Vec<ValidationError> {
        let schema_errors = validate_schema(plan);
        if !schema_errors.is_empty() {
            debug!(count = schema_errors.len(), "plan rejected at structural schema stage");
            return schema_errors;
        }

        // Schema acceptance guarantees `plan` deserializes into PlanDsl.
        let plan: PlanDsl = match serde_json::from_value(plan.clone()) {
            Ok(p) => p,
            Err(e) => return vec![ValidationError::new("schema", e.to_string(), "$")],
        };

        let mut errors = Vec::new();

        let metric = evidence.find_metric(&plan.metric_id);
        if metric.is_none() {
            errors.push(
                ValidationError::new(
                    "metric_not_found",
                    format!("metric_id '{}' is not among the retrieved evidence", plan.metric_id),
                    "metric_id",
                )
                .with_suggestions(sorted_ids(evidence.metric_candidates.iter().map(|m| m.metric_id.clone()))),
            );
        }

        let schema_set = evidence.schema_qualified_set();
        for (i, dim) in plan.dimensions.iter().enumerate() {
            if !schema_set.contains(&dim.qualified()) {
                errors.push(
                    ValidationError::new(
                        "dimension_field_invalid",
                        format!("dimension field '{}' is not in evidence", dim.qualified()),
                        format!("dimensions.{i}"),
                    )
                    .with_suggestions(top_n(sorted_set(&schema_set), 5)),
                );
            }
        }
        for (i, filter) in plan.filters.iter().enumerate() {
            if !schema_set.contains(&filter.qualified()) {
                errors.push(
                    ValidationError::new(
                        "filter_field_invalid",
                        format!("filter field '{}' is not in evidence", filter.qualified()),
                        format!("filters.{i}"),
                    )
                    .with_suggestions(top_n(sorted_set(&schema_set), 5)),
                );
            }
        }

        let mut referenced_tables: BTreeSet<String> = BTreeSet::new();
        referenced_tables.extend(plan.dimensions.iter().map(|d| d.table.clone()));
        referenced_tables.extend(plan.filters.iter().map(|f| f.table.clone()));
        if let Some(m) = metric {
            referenced_tables.extend(m.required_tables());
        }
        let time_entity = evidence.time_schema_entity(&referenced_tables);
        if let Some(t) = time_entity {
            referenced_tables.insert(t.table.clone());
        }

        if plan.join_path_id != crate::model::NONE_JOIN_PATH {
            match evidence.find_join_path(&plan.join_path_id) {
                None => {
                    errors.push(
                        ValidationError::new(
                            "join_path_not_found",
                            format!("join_path_id '{}' is not in evidence", plan.join_path_id),
                            "join_path_id",
                        )
                        .with_suggestions(sorted_ids(
                            evidence.join_paths.iter().map(|p| p.join_path_id.clone()),
                        )),
                    );
                }
                Some(path) => {
                    if !path.covers(&referenced_tables) {
                        errors.push(ValidationError::new(
                            "join_path_unreachable",
                            format!(
                                "join path '{}' does not cover referenced tables {:?}",
                                plan.join_path_id, referenced_tables
                            ),
                            "join_path_id",
                        ));
                    }
                }
            }
        } else if referenced_tables.len() > 1 {
            errors.push(ValidationError::new(
                "join_required",
                format!("plan references {} tables but join_path_id is NONE", referenced_tables.len()),
                "join_path_id",
            ));
        }

        match &plan.time_range {
            None => errors.push(ValidationError::new(
                "time_range_missing",
                "time_range is required",
                "time_range",
            )),
            Some(range) => {
                match (parse_iso_date(&range.start), parse_iso_date(&range.end)) {
                    (Some(start), Some(end)) if start > end => {
                        errors.push(ValidationError::new(
                            "time_range_invalid",
                            format!("time_range.start '{}' is after time_range.end '{}'", range.start, range.end),
                            "time_range",
                        ));
                    }
                    (Some(_), Some(_)) => {}
                    _ => errors.push(ValidationError::new(
                        "time_range_invalid",
                        "time_range.start/end must be ISO dates",
                        "time_range",
                    )),
                }
            }
        }

        if plan.intent == Intent::Trend && plan.time_grain.is_none() {
            errors.push(ValidationError::new(
                "time_grain_required",
                "intent 'trend' requires time_grain",
                "time_grain",
            ));
        }

        if time_entity.is_none() {
            errors.push(ValidationError::new(
                "time_field_missing",
                "no time-typed field is available in evidence schema or metric required fields",
                "time_range",
            ));
        }

        if let Some(template) = evidence.find_template(plan.intent) {
            if let Some(grain) = plan.time_grain {
                let required_funcs: BTreeSet<&str> = grain.required_funcs().iter().copied().collect();
                let allowed_funcs: BTreeSet<&str> =
                    template.allowed_funcs.iter().map(String::as_str).collect();
                if !required_funcs.is_subset(&allowed_funcs) {
                    errors.push(ValidationError::new(
                        "function_not_allowed",
                        format!("grain '{grain:?}' requires functions not in template.allowed_funcs"),
                        "time_grain",
                    ));
                }
            }
            if metric.is_some() {
                let allowed_aggs: BTreeSet<&str> =
                    template.allowed_aggs.iter().map(String::as_str).collect();
                if !allowed_aggs.contains(REQUIRED_AGG_FOR_KNOWN_METRIC) {
                    errors.push(ValidationError::new(
                        "agg_not_allowed",
                        "metric requires 'sum' aggregation not in template.allowed_aggs",
                        "metric_id",
                    ));
                }
            }
            for clause in &template.required_clauses {
                let present = match clause.as_str() {
                    "time_range" => plan.time_range.is_some(),
                    "time_grain" => plan.time_grain.is_some(),
                    "group_by_time" => plan.time_grain.is_some(),
                    "order_by" => plan.sort.is_some(),
                    "limit" => plan.limit.is_some(),
                    _ => true,
                };
                if !present {
                    errors.push(ValidationError::new(
                        "required_clause_missing",
                        format!("template requires clause '{clause}'"),
                        "$",
                    ));
                }
            }
        }

        info!(metric_id = %plan.metric_id, error_count = errors.len(), "semantic validation pass complete");
        errors
    }
}

impl Default for SemanticValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_iso_date(s: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn sorted_ids(ids: impl Iterator<Item = String>) -> Vec<String> {
    let mut v: Vec<String> = ids.collect();
    v.sort();
    v
}

fn sorted_set(set: &BTreeSet<String>) -> Vec<String> {
    set.iter().cloned().collect()
}

fn top_n(mut v: Vec<String>, n: usize) -> Vec<String> {
    v.truncate(n);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use serde_json::json;

    fn sample_evidence() -> EvidenceBundle {
        EvidenceBundle {
            metric_candidates: vec![MetricDef {
                metric_id: "load_rate".into(),
                name: "Load rate".into(),
                definition: "feeder load over capacity".into(),
                formula: "SUM(a)/SUM(b)".into(),
                required_fields: vec!["feeder.load_kw".into(), "feeder.capacity_kw".into()],
                default_time_grain: TimeGrain::Day,
                unit: None,
            }],
            schema_candidates: vec![SchemaEntity {
                table: "feeder".into(),
                field: "feeder_id".into(),
                field_desc: "feeder identifier".into(),
                aliases: vec![],
                unit: None,
                data_type: "varchar".into(),
                quality_tags: vec![],
            }],
            join_paths: vec![],
            template_rules: vec![TemplateRule {
                template_id: "trend_default".into(),
                intent: Intent::Trend,
                allowed_aggs: vec!["sum".into()],
                allowed_funcs: vec!["date_format".into()],
                required_clauses: vec!["time_range".into(), "time_grain".into()],
            }],
        }
    }

    #[test]
    fn unknown_dimension_field_is_reported() {
        let plan = json!({
            "version": "1.0",
            "intent": "trend",
            "metric_id": "load_rate",
            "dimensions": [{"table": "feeder", "field": "bad_field"}],
            "time_range": {"start": "2024-01-01", "end": "2024-01-31"},
            "time_grain": "day",
            "filters": [],
            "join_path_id": "NONE",
            "output": {"format": "table", "chart_suggest": "line"},
            "confidence": 0.5,
            "clarifications": []
        });
        let errors = SemanticValidator::new().validate(&plan, &sample_evidence());
        assert!(errors.iter().any(|e| e.code == "dimension_field_invalid"));
    }

    #[test]
    fn missing_join_path_id_is_reported() {
        let mut evidence = sample_evidence();
        evidence.join_paths.push(JoinPath {
            join_path_id: "valid_path".into(),
            description: "feeder path".into(),
            tables: vec!["feeder".into()],
            edges: vec![],
        });
        let plan = json!({
            "version": "1.0",
            "intent": "aggregate",
            "metric_id": "load_rate",
            "dimensions": [],
            "time_range": {"start": "2024-01-01", "end": "2024-01-31"},
            "filters": [],
            "join_path_id": "missing_path",
            "output": {"format": "single_value", "chart_suggest": "none"},
            "confidence": 0.5,
            "clarifications": []
        });
        let errors = SemanticValidator::new().validate(&plan, &evidence);
        assert!(errors.iter().any(|e| e.code == "join_path_not_found"));
    }

    #[test]
    fn pure_schema_shape_failure_reports_no_clause_errors() {
        let plan = json!({"version": "1.0"});
        let errors = SemanticValidator::new().validate(&plan, &sample_evidence());
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.code == "schema"));
    }

    #[test]
    fn idempotent_validation() {
        let plan = json!({"version": "1.0"});
        let v = SemanticValidator::new();
        let a = v.validate(&plan, &sample_evidence());
        let b = v.validate(&plan, &sample_evidence());
        assert_eq!(a, b);
    }
}
