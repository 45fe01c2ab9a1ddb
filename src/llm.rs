//! LLM adapter interface consumed by the planner and repair driver,
//! plus two implementations: an HTTP client for OpenAI-compatible
//! chat-completion APIs (grounded on the reqwest client pattern used for
//! the cluster's diagnostic LLM calls) and a deterministic mock used for
//! `llm_mode = mock` and for exercising the fail-closed paths in tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{Dimension, EvidenceBundle, MetricDef, SchemaEntity};

/// Closed set of LLM transport/parse error kinds. `Timeout` is carried as
/// a typed duration rather than detected by substring-matching the error
/// message: the HTTP adapter maps `reqwest::Error::is_timeout`
/// directly onto this variant.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm request timed out after {0:?}")]
    Timeout(Duration),
    #[error("llm transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("llm api error: {0}")]
    Api(String),
    #[error("llm rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("llm response was not valid JSON: {0}")]
    NotJson(String),
}

impl LlmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LlmError::Timeout(_))
    }
}

/// `generate_json` must return a JSON object; `generate_text` a free
/// string. Implementations may recover a JSON object embedded in
/// surrounding prose by locating the first balanced `{...}` span, with
/// bounded retries (default 2).
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn generate_json(&self, prompt: &str, schema: &Value) -> Result<Map<String, Value>, LlmError>;
    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Scan `text` for the first balanced `{...}` span and parse it as JSON.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;
    let mut depth = 0i32;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// HTTP adapter
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpLlmAdapterConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub json_extraction_retries: u32,
}

pub struct HttpLlmAdapter {
    client: reqwest::Client,
    config: HttpLlmAdapterConfig,
}

impl HttpLlmAdapter {
    pub fn new(config: HttpLlmAdapterConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn chat_completion(&self, system_prompt: &str, user_prompt: &str, force_json: bool) -> Result<String, LlmError> {
        let mut body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage { role: "system".into(), content: system_prompt.into() },
                ChatMessage { role: "user".into(), content: user_prompt.into() },
            ],
            temperature: 0.0,
            response_format: None,
        };
        if force_json {
            body.response_format = Some(ResponseFormat { r#type: "json_object".into() });
        }

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.config.timeout)
                } else {
                    LlmError::Transport(e)
                }
            })?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(LlmError::RateLimited(retry_after));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {text}")));
        }

        let parsed: ChatCompletionResponse = resp.json().await.map_err(LlmError::Transport)?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Api("empty choices in chat completion response".into()))
    }
}

#[async_trait]
impl LlmAdapter for HttpLlmAdapter {
    async fn generate_json(&self, prompt: &str, _schema: &Value) -> Result<Map<String, Value>, LlmError> {
        let system = "Respond with a single JSON object only.";
        let mut attempts = 0u32;
        loop {
            let content = self.chat_completion(system, prompt, true).await?;
            match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => return Ok(map),
                _ => match extract_json_object(&content) {
                    Some(Value::Object(map)) => return Ok(map),
                    _ => {
                        attempts += 1;
                        if attempts > self.config.json_extraction_retries {
                            return Err(LlmError::NotJson(content));
                        }
                    }
                },
            }
        }
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, LlmError> {
        self.chat_completion("Answer concisely.", prompt, false).await
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

// ============================================================================
// Mock adapter
// ============================================================================

/// Deterministic adapter used for `llm_mode = mock` and for exercising
/// fail-closed behaviour in tests. Parses the evidence bundle embedded in
/// the prompt (between `<INPUTS>`/`<INPUTS_TRIMMED>`/`<REPAIR_INPUTS>`
/// markers) and picks metric/dimension/intent/grain/sort from it, the way
/// a real model would be expected to.
pub struct MockLlmAdapter {
    pub force_invalid_json: bool,
    pub force_sql_leak: bool,
}

impl MockLlmAdapter {
    pub fn new() -> Self {
        Self { force_invalid_json: false, force_sql_leak: false }
    }

    pub fn force_invalid_json(mut self) -> Self {
        self.force_invalid_json = true;
        self
    }

    pub fn force_sql_leak(mut self) -> Self {
        self.force_sql_leak = true;
        self
    }
}

impl Default for MockLlmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmAdapter for MockLlmAdapter {
    async fn generate_json(&self, prompt: &str, _schema: &Value) -> Result<Map<String, Value>, LlmError> {
        if self.force_invalid_json {
            return Err(LlmError::NotJson("SELECT * FROM t".into()));
        }

        let evidence = extract_evidence(prompt);
        let question = extract_question(prompt);

        let metric_id = pick_metric(&evidence.metric_candidates, &question);
        let intent = pick_intent(&question);
        let join_path_id = evidence
            .join_paths
            .first()
            .map(|p| p.join_path_id.clone())
            .unwrap_or_else(|| "NONE".to_string());
        let dimension = pick_dimension(&evidence.schema_candidates);
        let time_grain = evidence
            .metric_candidates
            .iter()
            .find(|m| m.metric_id == metric_id)
            .map(|m| m.default_time_grain)
            .unwrap_or(crate::model::TimeGrain::Day);

        let dimensions = if self.force_sql_leak {
            vec![Value::String("bad' OR 1=1; SELECT * FROM secrets --".into())]
        } else if matches!(intent, "trend" | "rank") {
            dimension
                .map(|d| vec![serde_json::to_value(d).expect("dimension serializes")])
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut map = Map::new();
        map.insert("version".into(), Value::String("1.0".into()));
        map.insert("intent".into(), Value::String(intent.into()));
        map.insert("metric_id".into(), Value::String(metric_id));
        map.insert("metric_params".into(), Value::Object(Map::new()));
        map.insert("dimensions".into(), Value::Array(dimensions));
        map.insert(
            "time_range".into(),
            serde_json::json!({"start": "2024-01-01", "end": "2024-01-31"}),
        );
        map.insert("time_grain".into(), serde_json::to_value(time_grain).expect("time grain serializes"));
        map.insert("filters".into(), Value::Array(vec![]));
        map.insert("join_path_id".into(), Value::String(join_path_id));
        map.insert("sort".into(), pick_sort(intent));
        map.insert("limit".into(), serde_json::json!(if intent == "rank" { 10 } else { 200 }));
        map.insert("output".into(), pick_output(intent));
        map.insert("confidence".into(), serde_json::json!(0.6));
        map.insert("clarifications".into(), Value::Array(vec![]));
        Ok(map)
    }

    async fn generate_text(&self, _prompt: &str) -> Result<String, LlmError> {
        Ok("mock response: connect a real LLM to generate a natural-language answer.".into())
    }
}

/// Pull the question back out of a `...Question: {text}` prompt tail.
fn extract_question(prompt: &str) -> String {
    match prompt.rfind("Question:") {
        Some(idx) => prompt[idx + "Question:".len()..].trim().to_string(),
        None => prompt.to_string(),
    }
}

/// Recover the evidence bundle embedded in the prompt, whether it appears
/// directly under an `<INPUTS>`/`<INPUTS_TRIMMED>` marker or nested under
/// an `"evidence"` key in a `<REPAIR_INPUTS>` payload.
fn extract_evidence(prompt: &str) -> EvidenceBundle {
    for marker in ["<INPUTS_TRIMMED>", "<REPAIR_INPUTS>", "<INPUTS>"] {
        let Some(start) = prompt.find(marker) else { continue };
        let Some(value) = extract_json_object(&prompt[start + marker.len()..]) else { continue };
        let evidence_value = value.get("evidence").cloned().unwrap_or(value);
        if let Ok(evidence) = serde_json::from_value::<EvidenceBundle>(evidence_value) {
            return evidence;
        }
    }
    EvidenceBundle::default()
}

fn pick_metric(candidates: &[MetricDef], question: &str) -> String {
    if candidates.is_empty() {
        return "UNKNOWN".to_string();
    }
    let lowered = question.to_lowercase();
    let families: [(&[&str], &[&str]); 3] = [
        (&["rate", "ratio"], &["rate", "ratio"]),
        (&["bill", "cost", "amount"], &["bill", "cost", "amount"]),
        (&["load", "consumption", "usage"], &["load", "consumption", "usage"]),
    ];
    for (question_keywords, metric_keywords) in families {
        if question_keywords.iter().any(|k| lowered.contains(k)) {
            if let Some(m) = candidates.iter().find(|m| {
                metric_keywords
                    .iter()
                    .any(|k| m.metric_id.to_lowercase().contains(k) || m.name.to_lowercase().contains(k))
            }) {
                return m.metric_id.clone();
            }
        }
    }
    candidates[0].metric_id.clone()
}

fn pick_intent(question: &str) -> &'static str {
    let lowered = question.to_lowercase();
    if lowered.contains("rank") || lowered.contains("top") {
        "rank"
    } else if lowered.contains("compare") || lowered.contains(" vs ") {
        "compare"
    } else if lowered.contains("detail") || lowered.contains("list") {
        "detail"
    } else if lowered.contains("trend") || lowered.contains("over time") {
        "trend"
    } else {
        "aggregate"
    }
}

fn pick_dimension(schema_candidates: &[SchemaEntity]) -> Option<Dimension> {
    schema_candidates
        .iter()
        .find(|e| e.field.ends_with("_name"))
        .or_else(|| schema_candidates.first())
        .map(|e| Dimension { table: e.table.clone(), field: e.field.clone() })
}

fn pick_sort(intent: &str) -> Value {
    match intent {
        "rank" => serde_json::json!({"by": "metric", "order": "desc"}),
        "trend" => serde_json::json!({"by": "time_bucket", "order": "asc"}),
        _ => serde_json::json!({"by": "metric", "order": "desc"}),
    }
}

fn pick_output(intent: &str) -> Value {
    match intent {
        "trend" => serde_json::json!({"format": "table", "chart_suggest": "line"}),
        "rank" => serde_json::json!({"format": "table", "chart_suggest": "bar"}),
        _ => serde_json::json!({"format": "table", "chart_suggest": "none"}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_object_recovers_from_prose() {
        let text = "Sure, here is the plan: {\"a\": 1, \"b\": {\"c\": 2}} Hope that helps!";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"]["c"], 2);
    }

    #[test]
    fn extract_json_object_returns_none_without_braces() {
        assert!(extract_json_object("SELECT * FROM t").is_none());
    }

    #[tokio::test]
    async fn mock_adapter_force_invalid_json_errors() {
        let adapter = MockLlmAdapter::new().force_invalid_json();
        let err = adapter.generate_json("trend of load", &Value::Null).await.unwrap_err();
        assert!(matches!(err, LlmError::NotJson(_)));
    }

    #[tokio::test]
    async fn mock_adapter_picks_trend_intent_from_keyword() {
        let adapter = MockLlmAdapter::new();
        let plan = adapter.generate_json("show the trend of load over time", &Value::Null).await.unwrap();
        assert_eq!(plan["intent"], "trend");
    }

    fn sample_evidence_prompt(question: &str) -> String {
        let evidence = EvidenceBundle {
            metric_candidates: vec![MetricDef {
                metric_id: "total_load".into(),
                name: "Total load".into(),
                definition: "feeder load".into(),
                formula: "SUM(load_kw)".into(),
                required_fields: vec!["feeder_reading.load_kw".into()],
                default_time_grain: crate::model::TimeGrain::Hour,
                unit: None,
            }],
            schema_candidates: vec![SchemaEntity {
                table: "feeder_reading".into(),
                field: "feeder_name".into(),
                field_desc: "feeder name".into(),
                aliases: vec![],
                unit: None,
                data_type: "varchar".into(),
                quality_tags: vec![],
            }],
            join_paths: vec![],
            template_rules: vec![],
        };
        format!(
            "<INPUTS>\n{}\n</INPUTS>\nQuestion: {question}",
            serde_json::to_string_pretty(&evidence).unwrap()
        )
    }

    #[tokio::test]
    async fn mock_adapter_picks_metric_id_from_embedded_evidence() {
        let adapter = MockLlmAdapter::new();
        let prompt = sample_evidence_prompt("what is the trend of load over time");
        let plan = adapter.generate_json(&prompt, &Value::Null).await.unwrap();
        assert_eq!(plan["metric_id"], "total_load");
        assert_eq!(plan["time_grain"], "hour");
        assert_eq!(plan["dimensions"][0]["field"], "feeder_name");
    }

    #[tokio::test]
    async fn mock_adapter_falls_back_to_unknown_metric_without_evidence() {
        let adapter = MockLlmAdapter::new();
        let plan = adapter.generate_json("no evidence here", &Value::Null).await.unwrap();
        assert_eq!(plan["metric_id"], "UNKNOWN");
    }
}
