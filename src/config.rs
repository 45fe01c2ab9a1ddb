//! Layered configuration: CLI flags > environment variables (`TEXT2SQL_`
//! prefix) > `config.toml` file > built-in defaults.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::planner::LlmMode;

#[derive(Parser, Debug, Default)]
#[command(name = "text2sql-planner", about = "Grounded text-to-SQL planning pipeline demo")]
pub struct CommandLineArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub llm_mode: Option<String>,
    #[arg(long)]
    pub question: Option<String>,
    #[arg(long)]
    pub time_range_start: Option<String>,
    #[arg(long)]
    pub time_range_end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm_mode: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub llm_max_retries: u32,
    pub llm_plan_trim_top_k: usize,
    pub llm_plan_retry_on_timeout: bool,
    pub fixed_metric_id: Option<String>,
    pub rag_top_k: usize,
    pub rag_top_k_second: usize,
    pub reconstruct_empty_evidence_on_llm_path: bool,
    pub schema_kb_path: String,
    pub join_kb_path: String,
    pub metric_kb_path: String,
    pub template_kb_path: String,
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_mode: "mock".to_string(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_timeout_secs: 30,
            llm_max_retries: 2,
            llm_plan_trim_top_k: 3,
            llm_plan_retry_on_timeout: true,
            fixed_metric_id: None,
            rag_top_k: 5,
            rag_top_k_second: 10,
            reconstruct_empty_evidence_on_llm_path: false,
            schema_kb_path: "data/schema.json".to_string(),
            join_kb_path: "data/joins.json".to_string(),
            metric_kb_path: "data/metrics.json".to_string(),
            template_kb_path: "data/templates.json".to_string(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Settings {
    pub fn load(args: CommandLineArgs) -> anyhow::Result<Self> {
        let mut settings = match find_config_file(args.config.as_deref()) {
            Some(path) => Self::from_toml(&path)?,
            None => Settings::default(),
        };
        settings.apply_env_overrides();
        settings.apply_cli_overrides(&args);
        settings.validate()?;
        Ok(settings)
    }

    fn from_toml(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&raw)?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        macro_rules! env_str {
            ($field:expr, $key:literal) => {
                if let Ok(v) = std::env::var(concat!("TEXT2SQL_", $key)) {
                    $field = v;
                }
            };
        }
        macro_rules! env_parse {
            ($field:expr, $key:literal) => {
                if let Ok(v) = std::env::var(concat!("TEXT2SQL_", $key)) {
                    if let Ok(parsed) = v.parse() {
                        $field = parsed;
                    }
                }
            };
        }

        env_str!(self.llm_mode, "LLM_MODE");
        env_str!(self.llm_base_url, "LLM_BASE_URL");
        env_str!(self.llm_api_key, "LLM_API_KEY");
        env_str!(self.llm_model, "LLM_MODEL");
        env_parse!(self.llm_timeout_secs, "LLM_TIMEOUT_SECS");
        env_parse!(self.llm_max_retries, "LLM_MAX_RETRIES");
        env_parse!(self.llm_plan_trim_top_k, "LLM_PLAN_TRIM_TOP_K");
        env_parse!(self.llm_plan_retry_on_timeout, "LLM_PLAN_RETRY_ON_TIMEOUT");
        env_parse!(self.rag_top_k, "RAG_TOP_K");
        env_parse!(self.rag_top_k_second, "RAG_TOP_K_SECOND");
        env_parse!(self.reconstruct_empty_evidence_on_llm_path, "RECONSTRUCT_EMPTY_EVIDENCE_ON_LLM_PATH");
        if let Ok(v) = std::env::var("TEXT2SQL_FIXED_METRIC_ID") {
            self.fixed_metric_id = Some(v);
        }
        env_str!(self.schema_kb_path, "SCHEMA_KB_PATH");
        env_str!(self.join_kb_path, "JOIN_KB_PATH");
        env_str!(self.metric_kb_path, "METRIC_KB_PATH");
        env_str!(self.template_kb_path, "TEMPLATE_KB_PATH");
        env_str!(self.log_level, "LOG_LEVEL");
        if let Ok(v) = std::env::var("TEXT2SQL_LOG_FILE") {
            self.log_file = Some(v);
        }
    }

    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(mode) = &args.llm_mode {
            self.llm_mode = mode.clone();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.schema_kb_path.is_empty()
            || self.join_kb_path.is_empty()
            || self.metric_kb_path.is_empty()
            || self.template_kb_path.is_empty()
        {
            anyhow::bail!("knowledge base file paths must not be empty");
        }
        if self.rag_top_k == 0 || self.rag_top_k_second == 0 {
            anyhow::bail!("rag_top_k and rag_top_k_second must be positive");
        }
        if self.llm_mode == "real" && self.llm_api_key.is_empty() {
            anyhow::bail!("llm_api_key is required when llm_mode = real");
        }
        Ok(())
    }

    pub fn llm_mode(&self) -> LlmMode {
        match self.llm_mode.as_str() {
            "no_llm" => LlmMode::NoLlm,
            "real" => LlmMode::Real,
            _ => LlmMode::Mock,
        }
    }
}

/// Candidate config file paths, checked in order.
fn find_config_file(explicit: Option<&std::path::Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        return None;
    }
    for candidate in ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn real_mode_without_api_key_fails_validation() {
        let mut settings = Settings::default();
        settings.llm_mode = "real".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn llm_mode_parses_known_variants() {
        let mut settings = Settings::default();
        settings.llm_mode = "no_llm".to_string();
        assert!(matches!(settings.llm_mode(), LlmMode::NoLlm));
    }
}
