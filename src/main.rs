use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Map;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use text2sql_planner::config::{CommandLineArgs, Settings};
use text2sql_planner::llm::{HttpLlmAdapter, HttpLlmAdapterConfig, LlmAdapter, MockLlmAdapter};
use text2sql_planner::planner::{LlmMode, Planner, PlannerConfig};
use text2sql_planner::{KbSet, SqlCompiler};

/// Build the subscriber for the requested log level, additionally mirroring
/// output to a daily-rolling file when `log_file` is configured. Returns the
/// non-blocking writer's flush guard, which the caller must hold for the
/// lifetime of the process.
fn init_tracing(log_level: &str, log_file: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(log_file) => {
            let log_path = std::path::Path::new(log_file);
            if let Some(parent) = log_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
            let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("text2sql-planner.log");
            let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

            let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            registry.with(fmt::layer().with_writer(non_blocking)).with(fmt::layer()).init();
            Some(guard)
        }
        None => {
            registry.with(fmt::layer()).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CommandLineArgs::parse();
    let question = args.question.clone().unwrap_or_else(|| "what is the total load this month".to_string());
    let time_range_start = args.time_range_start.clone();
    let time_range_end = args.time_range_end.clone();

    let settings = Settings::load(args)?;
    let _log_guard = init_tracing(&settings.log_level, settings.log_file.as_deref());
    tracing::info!(mode = %settings.llm_mode, "loaded settings");

    let kb = Arc::new(KbSet::load(
        &PathBuf::from(&settings.schema_kb_path),
        &PathBuf::from(&settings.join_kb_path),
        &PathBuf::from(&settings.metric_kb_path),
        &PathBuf::from(&settings.template_kb_path),
    )?);

    let adapter: Arc<dyn LlmAdapter> = match settings.llm_mode() {
        LlmMode::Real => Arc::new(HttpLlmAdapter::new(HttpLlmAdapterConfig {
            api_base: settings.llm_base_url.clone(),
            api_key: settings.llm_api_key.clone(),
            model: settings.llm_model.clone(),
            timeout: Duration::from_secs(settings.llm_timeout_secs),
            json_extraction_retries: settings.llm_max_retries,
        })?),
        _ => Arc::new(MockLlmAdapter::new()),
    };

    let planner = Planner::new(
        kb,
        adapter,
        PlannerConfig {
            llm_mode: settings.llm_mode(),
            rag_top_k: settings.rag_top_k,
            rag_top_k_second: settings.rag_top_k_second,
            llm_plan_trim_top_k: settings.llm_plan_trim_top_k,
            llm_plan_retry_on_timeout: settings.llm_plan_retry_on_timeout,
            fixed_metric_id: settings.fixed_metric_id.clone(),
            reconstruct_empty_evidence_on_llm_path: settings.reconstruct_empty_evidence_on_llm_path,
        },
    );

    let time_range = match (time_range_start, time_range_end) {
        (Some(start), Some(end)) => Some(text2sql_planner::model::TimeRange { start, end }),
        _ => None,
    };

    tracing::info!(%question, "generating plan");
    let result = planner.generate_plan(&question, &Map::new(), time_range).await?;
    tracing::info!(summary = %result.evidence_summary, "plan accepted");

    let sql = SqlCompiler::new().compile(&result.plan, &result.evidence)?;
    println!("{sql}");

    Ok(())
}
