//! The Repair Driver: given a rejected plan plus errors plus
//! evidence, asks the LLM adapter for a full replacement plan. It does
//! not re-validate; that remains the planner's job.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::llm::{LlmAdapter, LlmError};
use crate::model::{EvidenceBundle, ValidationError};
use crate::plan_schema::plan_dsl_schema;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("llm repair output was not a JSON object")]
    RepairOutputNotJson,
    #[error(transparent)]
    Llm(#[from] LlmError),
}

pub struct RepairDriver {
    adapter: Arc<dyn LlmAdapter>,
}

impl RepairDriver {
    pub fn new(adapter: Arc<dyn LlmAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn repair(
        &self,
        original_plan: &Value,
        errors: &[ValidationError],
        evidence: &EvidenceBundle,
    ) -> Result<Value, RepairError> {
        let payload = json!({
            "original_plan": original_plan,
            "errors": errors,
            "evidence": evidence,
            "schema": plan_dsl_schema(),
        });
        let prompt = format!(
            "Repair the following plan so it satisfies the schema and resolves every listed error.\n<REPAIR_INPUTS>\n{payload}\n</REPAIR_INPUTS>"
        );
        info!(error_count = errors.len(), "invoking llm adapter to repair rejected plan");
        let map = self.adapter.generate_json(&prompt, plan_dsl_schema()).await;
        match map {
            Ok(map) => {
                info!("repair produced a replacement plan");
                Ok(Value::Object(map))
            }
            Err(LlmError::NotJson(_)) => {
                error!("repair output was not valid json, giving up");
                Err(RepairError::RepairOutputNotJson)
            }
            Err(e) => {
                error!(error = %e, "repair call to llm adapter failed");
                Err(RepairError::Llm(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmAdapter;
    use crate::model::EvidenceBundle;

    #[tokio::test]
    async fn repair_propagates_non_json_as_repair_specific_error() {
        let adapter = Arc::new(MockLlmAdapter::new().force_invalid_json());
        let driver = RepairDriver::new(adapter);
        let original = json!({"version": "1.0"});
        let errors = vec![ValidationError::new("schema", "missing fields", "$")];
        let result = driver.repair(&original, &errors, &EvidenceBundle::default()).await;
        assert!(matches!(result, Err(RepairError::RepairOutputNotJson)));
    }

    #[tokio::test]
    async fn repair_returns_replacement_plan_object() {
        let adapter = Arc::new(MockLlmAdapter::new());
        let driver = RepairDriver::new(adapter);
        let original = json!({"version": "1.0"});
        let errors = vec![ValidationError::new("metric_not_found", "no such metric", "metric_id")];
        let result = driver.repair(&original, &errors, &EvidenceBundle::default()).await.unwrap();
        assert!(result.is_object());
    }
}
