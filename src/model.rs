//! Data model for the grounded planning pipeline: catalogue entities
//! retrieved from the knowledge bases, the evidence bundle assembled from
//! them for one request, and the Plan DSL intermediate representation.
//!
//! Every type here rejects unknown JSON fields, mirroring the knowledge
//! base file contract (unknown fields are rejected).

use serde::{Deserialize, Serialize};

/// One column-like catalogue entry, keyed by `table.field`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaEntity {
    pub table: String,
    pub field: String,
    pub field_desc: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub unit: Option<String>,
    pub data_type: String,
    #[serde(default)]
    pub quality_tags: Vec<String>,
}

impl SchemaEntity {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.field)
    }

    /// Time-typed field name set used for time-field resolution.
    pub const TIME_FIELD_NAMES: [&'static str; 5] =
        ["ts", "timestamp", "event_time", "date", "dt"];

    /// Time-typed data types.
    pub const TIME_DATA_TYPES: [&'static str; 3] = ["datetime", "timestamp", "date"];

    pub fn is_time_field_name(&self) -> bool {
        Self::TIME_FIELD_NAMES.contains(&self.field.as_str())
    }

    pub fn is_time_data_type(&self) -> bool {
        Self::TIME_DATA_TYPES.contains(&self.data_type.as_str())
    }

    pub fn is_time_typed(&self) -> bool {
        self.is_time_field_name() || self.is_time_data_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

impl JoinType {
    pub fn sql_keyword(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinEdge {
    pub left_table: String,
    pub left_field: String,
    pub right_table: String,
    pub right_field: String,
    pub join_type: JoinType,
}

/// A pre-enumerated, ordered sequence of edges connecting a set of tables;
/// the only permitted way to introduce a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinPath {
    pub join_path_id: String,
    pub description: String,
    pub tables: Vec<String>,
    pub edges: Vec<JoinEdge>,
}

impl JoinPath {
    /// The first edge's `left_table` is the canonical base table for the path.
    pub fn base_table(&self) -> Option<&str> {
        self.edges.first().map(|e| e.left_table.as_str())
    }

    pub fn covers(&self, tables: &std::collections::BTreeSet<String>) -> bool {
        tables.iter().all(|t| self.tables.contains(t))
    }
}

/// A named, pre-defined aggregation over catalogued fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricDef {
    pub metric_id: String,
    pub name: String,
    pub definition: String,
    pub formula: String,
    pub required_fields: Vec<String>,
    pub default_time_grain: TimeGrain,
    #[serde(default)]
    pub unit: Option<String>,
}

impl MetricDef {
    /// Tables implied by `required_fields` (each of the form `table.field`).
    pub fn required_tables(&self) -> std::collections::BTreeSet<String> {
        self.required_fields
            .iter()
            .filter_map(|f| f.split_once('.').map(|(t, _)| t.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Trend,
    Aggregate,
    Rank,
    Compare,
    Detail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    #[serde(rename = "15m")]
    Fifteen,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeGrain {
    pub fn required_funcs(self) -> &'static [&'static str] {
        match self {
            TimeGrain::Fifteen => &["from_unixtime", "unix_timestamp"],
            TimeGrain::Hour | TimeGrain::Day | TimeGrain::Month => &["date_format"],
            TimeGrain::Week => &["yearweek"],
        }
    }
}

/// Permitted-aggregation / permitted-function / required-clause policy for
/// a given intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateRule {
    pub template_id: String,
    pub intent: Intent,
    pub allowed_aggs: Vec<String>,
    pub allowed_funcs: Vec<String>,
    pub required_clauses: Vec<String>,
}

/// A read-only snapshot of the four retrieved lists for one request. All
/// validator and compiler authorization decisions consult only this
/// bundle (or, on metric recovery, the full metric knowledge base):
/// anything not in the bundle does not exist for planning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub metric_candidates: Vec<MetricDef>,
    pub schema_candidates: Vec<SchemaEntity>,
    pub join_paths: Vec<JoinPath>,
    pub template_rules: Vec<TemplateRule>,
}

impl EvidenceBundle {
    pub fn schema_qualified_set(&self) -> std::collections::BTreeSet<String> {
        self.schema_candidates.iter().map(SchemaEntity::qualified).collect()
    }

    pub fn find_metric(&self, metric_id: &str) -> Option<&MetricDef> {
        self.metric_candidates.iter().find(|m| m.metric_id == metric_id)
    }

    pub fn find_join_path(&self, join_path_id: &str) -> Option<&JoinPath> {
        self.join_paths.iter().find(|p| p.join_path_id == join_path_id)
    }

    pub fn find_template(&self, intent: Intent) -> Option<&TemplateRule> {
        self.template_rules.iter().find(|t| t.intent == intent)
    }

    /// First schema candidate carrying a time-typed field, preferring
    /// tables referenced by `prefer_tables`.
    pub fn time_schema_entity(
        &self,
        prefer_tables: &std::collections::BTreeSet<String>,
    ) -> Option<&SchemaEntity> {
        self.schema_candidates
            .iter()
            .filter(|e| e.is_time_typed() && prefer_tables.contains(&e.table))
            .chain(self.schema_candidates.iter().filter(|e| e.is_time_typed()))
            .next()
    }
}

// ============================================================================
// Plan DSL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    In,
    Like,
    Between,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    pub table: String,
    pub field: String,
}

impl Dimension {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    pub table: String,
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl Filter {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SortSpec {
    pub by: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Table,
    SingleValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartSuggest {
    Line,
    Bar,
    Heatmap,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub chart_suggest: ChartSuggest,
}

/// The frozen, typed Plan DSL. In-flight plans (during LLM exchange and
/// validation) are `serde_json::Value`; a plan is deserialized into this
/// shape only after semantic validation returns an empty error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanDsl {
    pub version: String,
    pub intent: Intent,
    pub metric_id: String,
    #[serde(default)]
    pub metric_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub time_grain: Option<TimeGrain>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub join_path_id: String,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub limit: Option<u32>,
    pub output: OutputSpec,
    pub confidence: f64,
    #[serde(default)]
    pub clarifications: Vec<String>,
    #[serde(default)]
    pub errors_unresolved: Option<Vec<String>>,
}

pub const NONE_JOIN_PATH: &str = "NONE";

/// One structured validator finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
    pub field_path: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ValidationError {
    pub fn new(code: &str, message: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            field_path: field_path.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_required_tables_dedupes_across_fields() {
        let m = MetricDef {
            metric_id: "load_rate".into(),
            name: "Load rate".into(),
            definition: "feeder load over capacity".into(),
            formula: "SUM(load)/SUM(capacity)".into(),
            required_fields: vec!["feeder.load_kw".into(), "feeder.capacity_kw".into()],
            default_time_grain: TimeGrain::Day,
            unit: None,
        };
        assert_eq!(m.required_tables().len(), 1);
    }

    #[test]
    fn join_path_base_table_is_first_edge_left_table() {
        let path = JoinPath {
            join_path_id: "p1".into(),
            description: "feeder to meter".into(),
            tables: vec!["feeder".into(), "meter".into()],
            edges: vec![JoinEdge {
                left_table: "feeder".into(),
                left_field: "feeder_id".into(),
                right_table: "meter".into(),
                right_field: "feeder_id".into(),
                join_type: JoinType::Inner,
            }],
        };
        assert_eq!(path.base_table(), Some("feeder"));
    }

    #[test]
    fn schema_entity_rejects_unknown_fields() {
        let raw = r#"{"table":"feeder","field":"feeder_id","field_desc":"id","data_type":"varchar","bogus":1}"#;
        assert!(serde_json::from_str::<SchemaEntity>(raw).is_err());
    }
}
