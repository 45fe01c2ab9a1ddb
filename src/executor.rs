//! The Executor boundary: an external collaborator this crate
//! does not implement beyond a minimal in-memory stand-in. Real database
//! execution is explicitly out of scope.

use async_trait::async_trait;

use crate::model::{EvidenceBundle, PlanDsl};

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        plan: &PlanDsl,
        evidence: &EvidenceBundle,
    ) -> anyhow::Result<ExecutionResult>;
}

/// Test/demo stand-in that echoes back an empty result set. No real
/// database driver is implemented here.
pub struct InMemoryExecutor;

#[async_trait]
impl Executor for InMemoryExecutor {
    async fn execute(
        &self,
        _sql: &str,
        _plan: &PlanDsl,
        _evidence: &EvidenceBundle,
    ) -> anyhow::Result<ExecutionResult> {
        Ok(ExecutionResult::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use serde_json::Map;

    #[tokio::test]
    async fn in_memory_executor_returns_empty_result() {
        let plan = PlanDsl {
            version: "1.0".into(),
            intent: Intent::Aggregate,
            metric_id: "load_rate".into(),
            metric_params: Map::new(),
            dimensions: vec![],
            time_range: None,
            time_grain: None,
            filters: vec![],
            join_path_id: "NONE".into(),
            sort: None,
            limit: None,
            output: OutputSpec { format: OutputFormat::SingleValue, chart_suggest: ChartSuggest::None },
            confidence: 0.1,
            clarifications: vec![],
            errors_unresolved: None,
        };
        let result = InMemoryExecutor.execute("SELECT 1", &plan, &EvidenceBundle::default()).await.unwrap();
        assert!(result.rows.is_empty());
    }
}
