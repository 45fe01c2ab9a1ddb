//! Deterministic plan-to-SQL compiler for the fixed target dialect
//! (MySQL/StarRocks-like). The plan is assumed validated; the compiler
//! nonetheless re-enforces the evidence-based allow-list as a
//! defence-in-depth guard against fields that should never reach SQL.

use std::collections::BTreeSet;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::model::{Filter, FilterOp, Intent, JoinPath, PlanDsl, SchemaEntity, TimeGrain};
use crate::model::{EvidenceBundle, NONE_JOIN_PATH};

const DEFAULT_LIMIT: u32 = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("unauthorized field access: {0}")]
    UnauthorizedField(String),
    #[error("unsupported time grain: {0}")]
    UnsupportedGrain(String),
    #[error("missing metric: {0}")]
    MissingMetric(String),
    #[error("missing time field")]
    MissingTimeField,
    #[error("unsupported operator: {0}")]
    UnsupportedOp(String),
}

pub struct SqlCompiler;

impl SqlCompiler {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(&self, plan: &PlanDsl, evidence: &EvidenceBundle) -> Result<String, CompileError> {
        info!(metric_id = %plan.metric_id, intent = ?plan.intent, "compiling plan to sql");
        let allow_list = build_allow_list(plan, evidence);
        debug!(allow_list_size = allow_list.len(), "allow-list built from evidence");

        let metric = evidence.find_metric(&plan.metric_id).ok_or_else(|| {
            error!(metric_id = %plan.metric_id, "metric missing from evidence at compile time");
            CompileError::MissingMetric(plan.metric_id.clone())
        })?;
        let metric_expr = match metric.required_fields.as_slice() {
            [a] => format!("SUM({a})"),
            [a, b] => format!("SUM({a})/NULLIF(SUM({b}),0)"),
            _ => return Err(CompileError::MissingMetric(plan.metric_id.clone())),
        };

        let time_field = resolve_time_field(evidence, metric)
            .ok_or(CompileError::MissingTimeField)?;

        let join_path = if plan.join_path_id != NONE_JOIN_PATH {
            Some(evidence.find_join_path(&plan.join_path_id).ok_or_else(|| {
                CompileError::UnauthorizedField(format!("unknown join_path_id {}", plan.join_path_id))
            })?)
        } else {
            None
        };

        let base_table = join_path
            .and_then(JoinPath::base_table)
            .map(|s| s.to_string())
            .or_else(|| plan.dimensions.first().map(|d| d.table.clone()))
            .or_else(|| {
                metric.required_fields.first().and_then(|f| f.split('.').next()).map(|s| s.to_string())
            })
            .unwrap_or_else(|| time_field.table_str());

        let mut select_exprs = Vec::new();
        let mut group_by_exprs = Vec::new();

        if plan.intent == Intent::Trend {
            let grain = plan.time_grain.ok_or_else(|| {
                CompileError::UnsupportedGrain("trend intent requires a time_grain".into())
            })?;
            let bucket = bucket_expression(grain, &time_field.qualified());
            select_exprs.push(format!("{bucket} AS time_bucket"));
            group_by_exprs.push("time_bucket".to_string());
        }

        for dim in &plan.dimensions {
            let qualified = dim.qualified();
            if !allow_list.contains(&qualified) {
                return Err(CompileError::UnauthorizedField(qualified));
            }
            select_exprs.push(qualified.clone());
            group_by_exprs.push(qualified);
        }

        select_exprs.push(format!("{metric_expr} AS {}", plan.metric_id));

        let mut joins = Vec::new();
        if let Some(path) = join_path {
            for edge in &path.edges {
                joins.push(format!(
                    "{} JOIN {} ON {}.{} = {}.{}",
                    edge.join_type.sql_keyword(),
                    edge.right_table,
                    edge.left_table,
                    edge.left_field,
                    edge.right_table,
                    edge.right_field,
                ));
            }
        }

        let mut where_clauses = Vec::new();
        if let Some(range) = &plan.time_range {
            where_clauses.push(format!(
                "{} BETWEEN '{}' AND '{}'",
                time_field.qualified(),
                escape_literal(&range.start),
                escape_literal(&range.end)
            ));
        }
        for filter in &plan.filters {
            where_clauses.push(render_filter(filter, &allow_list)?);
        }

        let order_by = resolve_order_by(plan, &allow_list)?;

        let limit = plan.limit.unwrap_or(DEFAULT_LIMIT);

        let mut sql = format!("SELECT {}\nFROM {}", select_exprs.join(", "), base_table);
        for join in &joins {
            sql.push('\n');
            sql.push_str(join);
        }
        if !where_clauses.is_empty() {
            sql.push_str("\nWHERE ");
            sql.push_str(&where_clauses.join(" AND "));
        }
        if !group_by_exprs.is_empty() {
            sql.push_str("\nGROUP BY ");
            sql.push_str(&group_by_exprs.join(", "));
        }
        if let Some(order) = order_by {
            sql.push_str("\nORDER BY ");
            sql.push_str(&order);
        }
        sql.push_str(&format!("\nLIMIT {limit}"));

        info!("sql compiled successfully");
        Ok(sql)
    }
}

impl Default for SqlCompiler {
    fn default() -> Self {
        Self::new()
    }
}

fn build_allow_list(plan: &PlanDsl, evidence: &EvidenceBundle) -> BTreeSet<String> {
    let mut allow_list: BTreeSet<String> = evidence.schema_qualified_set();
    if let Some(metric) = evidence.find_metric(&plan.metric_id) {
        allow_list.extend(metric.required_fields.iter().cloned());
    }
    if plan.join_path_id != NONE_JOIN_PATH {
        if let Some(path) = evidence.find_join_path(&plan.join_path_id) {
            for edge in &path.edges {
                allow_list.insert(format!("{}.{}", edge.left_table, edge.left_field));
                allow_list.insert(format!("{}.{}", edge.right_table, edge.right_field));
            }
        }
    }
    allow_list
}

fn resolve_time_field<'a>(
    evidence: &'a EvidenceBundle,
    metric: &crate::model::MetricDef,
) -> Option<TimeFieldRef<'a>> {
    if let Some(entity) = evidence
        .schema_candidates
        .iter()
        .find(|e| e.is_time_field_name())
    {
        return Some(TimeFieldRef::Entity(entity));
    }
    if let Some(entity) = evidence
        .schema_candidates
        .iter()
        .find(|e| e.is_time_data_type())
    {
        return Some(TimeFieldRef::Entity(entity));
    }
    metric
        .required_fields
        .iter()
        .find(|f| f.split_once('.').map(|(_, field)| SchemaEntity::TIME_FIELD_NAMES.contains(&field)).unwrap_or(false))
        .map(|f| TimeFieldRef::Qualified(f.clone()))
}

enum TimeFieldRef<'a> {
    Entity(&'a SchemaEntity),
    Qualified(String),
}

impl TimeFieldRef<'_> {
    fn qualified(&self) -> String {
        match self {
            TimeFieldRef::Entity(e) => e.qualified(),
            TimeFieldRef::Qualified(q) => q.clone(),
        }
    }

    fn table_str(&self) -> String {
        match self {
            TimeFieldRef::Entity(e) => e.table.clone(),
            TimeFieldRef::Qualified(q) => q.split('.').next().unwrap_or_default().to_string(),
        }
    }
}

fn bucket_expression(grain: TimeGrain, time_field: &str) -> String {
    match grain {
        TimeGrain::Fifteen => {
            format!("FROM_UNIXTIME(FLOOR(UNIX_TIMESTAMP({time_field})/900)*900)")
        }
        TimeGrain::Hour => format!("DATE_FORMAT({time_field},'%Y-%m-%d %H:00:00')"),
        TimeGrain::Day => format!("DATE_FORMAT({time_field},'%Y-%m-%d')"),
        TimeGrain::Week => format!("YEARWEEK({time_field},1)"),
        TimeGrain::Month => format!("DATE_FORMAT({time_field},'%Y-%m')"),
    }
}

fn render_filter(filter: &Filter, allow_list: &BTreeSet<String>) -> Result<String, CompileError> {
    let qualified = filter.qualified();
    if !allow_list.contains(&qualified) {
        return Err(CompileError::UnauthorizedField(qualified));
    }
    match filter.op {
        FilterOp::Eq => Ok(format!("{qualified} = {}", render_literal(&filter.value)?)),
        FilterOp::Ne => Ok(format!("{qualified} != {}", render_literal(&filter.value)?)),
        FilterOp::Gt => Ok(format!("{qualified} > {}", render_literal(&filter.value)?)),
        FilterOp::Ge => Ok(format!("{qualified} >= {}", render_literal(&filter.value)?)),
        FilterOp::Lt => Ok(format!("{qualified} < {}", render_literal(&filter.value)?)),
        FilterOp::Le => Ok(format!("{qualified} <= {}", render_literal(&filter.value)?)),
        FilterOp::Like => Ok(format!("{qualified} LIKE {}", render_literal(&filter.value)?)),
        FilterOp::In => {
            let items = filter.value.as_array().ok_or_else(|| {
                CompileError::UnsupportedOp("'in' filter requires a list value".into())
            })?;
            let rendered: Result<Vec<String>, CompileError> =
                items.iter().map(render_literal).collect();
            Ok(format!("{qualified} IN ({})", rendered?.join(", ")))
        }
        FilterOp::Between => {
            let items = filter.value.as_array().ok_or_else(|| {
                CompileError::UnsupportedOp("'between' filter requires a two-element list".into())
            })?;
            if items.len() != 2 {
                return Err(CompileError::UnsupportedOp(
                    "'between' filter requires exactly two values".into(),
                ));
            }
            Ok(format!(
                "{qualified} BETWEEN {} AND {}",
                render_literal(&items[0])?,
                render_literal(&items[1])?
            ))
        }
    }
}

fn render_literal(value: &Value) -> Result<String, CompileError> {
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(format!("'{}'", escape_literal(s))),
        Value::Bool(b) => Ok(format!("'{b}'")),
        other => Err(CompileError::UnsupportedOp(format!("unsupported filter value {other}"))),
    }
}

fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

fn resolve_order_by(plan: &PlanDsl, allow_list: &BTreeSet<String>) -> Result<Option<String>, CompileError> {
    if let Some(sort) = &plan.sort {
        // Ascending is sqlglot's implicit default (`desc=False`): no keyword
        // is emitted for it, only DESC is ever written out explicitly.
        let order_suffix = match sort.order {
            crate::model::SortOrder::Asc => "",
            crate::model::SortOrder::Desc => " DESC",
        };
        let target = if sort.by == "metric" || sort.by == plan.metric_id {
            plan.metric_id.clone()
        } else if sort.by == "time" || sort.by == "time_bucket" {
            if plan.intent != Intent::Trend {
                return Err(CompileError::UnsupportedOp(
                    "sorting by time_bucket is only allowed for trend intent".into(),
                ));
            }
            "time_bucket".to_string()
        } else if sort.by.contains('.') {
            if !allow_list.contains(&sort.by) {
                return Err(CompileError::UnauthorizedField(sort.by.clone()));
            }
            sort.by.clone()
        } else {
            allow_list
                .iter()
                .find(|q| q.ends_with(&format!(".{}", sort.by)))
                .cloned()
                .ok_or_else(|| CompileError::UnauthorizedField(sort.by.clone()))?
        };
        return Ok(Some(format!("{target}{order_suffix}")));
    }
    if plan.intent == Intent::Trend {
        return Ok(Some("time_bucket".to_string()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn sample_evidence() -> EvidenceBundle {
        EvidenceBundle {
            metric_candidates: vec![MetricDef {
                metric_id: "load_rate".into(),
                name: "Load rate".into(),
                definition: "feeder load".into(),
                formula: "SUM(a)".into(),
                required_fields: vec!["feeder.load_kw".into()],
                default_time_grain: TimeGrain::Day,
                unit: None,
            }],
            schema_candidates: vec![
                SchemaEntity {
                    table: "feeder".into(),
                    field: "event_time".into(),
                    field_desc: "reading time".into(),
                    aliases: vec![],
                    unit: None,
                    data_type: "datetime".into(),
                    quality_tags: vec![],
                },
                SchemaEntity {
                    table: "feeder".into(),
                    field: "load_kw".into(),
                    field_desc: "load".into(),
                    aliases: vec![],
                    unit: Some("kw".into()),
                    data_type: "double".into(),
                    quality_tags: vec![],
                },
            ],
            join_paths: vec![JoinPath {
                join_path_id: "p1".into(),
                description: "feeder only".into(),
                tables: vec!["feeder".into()],
                edges: vec![],
            }],
            template_rules: vec![],
        }
    }

    fn sample_trend_plan() -> PlanDsl {
        PlanDsl {
            version: "1.0".into(),
            intent: Intent::Trend,
            metric_id: "load_rate".into(),
            metric_params: Default::default(),
            dimensions: vec![],
            time_range: Some(TimeRange { start: "2024-01-01".into(), end: "2024-01-31".into() }),
            time_grain: Some(TimeGrain::Day),
            filters: vec![],
            join_path_id: NONE_JOIN_PATH.into(),
            sort: None,
            limit: None,
            output: OutputSpec { format: OutputFormat::Table, chart_suggest: ChartSuggest::Line },
            confidence: 0.9,
            clarifications: vec![],
            errors_unresolved: None,
        }
    }

    #[test]
    fn trend_happy_path_bucket_and_order() {
        let sql = SqlCompiler::new().compile(&sample_trend_plan(), &sample_evidence()).unwrap();
        assert!(sql.starts_with("SELECT DATE_FORMAT(feeder.event_time,'%Y-%m-%d') AS time_bucket"));
        assert!(sql.trim_end().ends_with("ORDER BY time_bucket\nLIMIT 200"));
    }

    #[test]
    fn unauthorized_dimension_field_is_rejected_at_compile() {
        let mut plan = sample_trend_plan();
        plan.dimensions.push(Dimension { table: "feeder".into(), field: "bad_field".into() });
        let err = SqlCompiler::new().compile(&plan, &sample_evidence()).unwrap_err();
        assert!(matches!(err, CompileError::UnauthorizedField(_)));
    }

    #[test]
    fn metric_formula_law_single_field_is_sum() {
        let sql = SqlCompiler::new().compile(&sample_trend_plan(), &sample_evidence()).unwrap();
        assert!(sql.contains("SUM(feeder.load_kw) AS load_rate"));
    }

    #[test]
    fn metric_formula_law_two_fields_is_ratio() {
        let mut evidence = sample_evidence();
        evidence.metric_candidates[0].required_fields.push("feeder.capacity_kw".into());
        evidence.schema_candidates.push(SchemaEntity {
            table: "feeder".into(),
            field: "capacity_kw".into(),
            field_desc: "capacity".into(),
            aliases: vec![],
            unit: None,
            data_type: "double".into(),
            quality_tags: vec![],
        });
        let sql = SqlCompiler::new().compile(&sample_trend_plan(), &evidence).unwrap();
        assert!(sql.contains("SUM(feeder.load_kw)/NULLIF(SUM(feeder.capacity_kw),0) AS load_rate"));
    }

    #[test]
    fn time_bucket_table_matches_each_grain_exactly() {
        let cases = [
            (TimeGrain::Fifteen, "FROM_UNIXTIME(FLOOR(UNIX_TIMESTAMP(feeder.event_time)/900)*900)"),
            (TimeGrain::Hour, "DATE_FORMAT(feeder.event_time,'%Y-%m-%d %H:00:00')"),
            (TimeGrain::Day, "DATE_FORMAT(feeder.event_time,'%Y-%m-%d')"),
            (TimeGrain::Week, "YEARWEEK(feeder.event_time,1)"),
            (TimeGrain::Month, "DATE_FORMAT(feeder.event_time,'%Y-%m')"),
        ];
        for (grain, expected) in cases {
            assert_eq!(bucket_expression(grain, "feeder.event_time"), expected);
        }
    }

    #[test]
    fn filter_in_requires_list_value() {
        let mut plan = sample_trend_plan();
        plan.filters.push(Filter {
            table: "feeder".into(),
            field: "load_kw".into(),
            op: FilterOp::In,
            value: serde_json::json!(5),
        });
        let err = SqlCompiler::new().compile(&plan, &sample_evidence()).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOp(_)));
    }
}
