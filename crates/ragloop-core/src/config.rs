use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::retrieval::SearchOptions;
use crate::telemetry::TelemetryOptions;
use crate::web::TAVILY_SEARCH_URL;
use crate::{RagLoopError, require_env};

const DEFAULT_CONFIG_PATH: &str = "ragloop.toml";
const CONFIG_PATH_ENV: &str = "RAGLOOP_CONFIG";

/// Chat backends reachable through the OpenAI-compatible client.
pub const SUPPORTED_LLM_PROVIDERS: [&str; 2] = ["openai", "openai-compatible"];

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `RAGLOOP_CONFIG` environment variable.
    /// 3. `ragloop.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<Config, RagLoopError> {
        let candidate = resolve_path(path);
        let raw = fs::read_to_string(&candidate)
            .map_err(|err| RagLoopError::config_io(candidate.clone(), err))?;
        let config = Self::parse(&raw)?;

        // Fail at load time rather than on the first model call.
        require_env(&config.llm.api_key_env)?;
        Ok(config)
    }

    /// Parse and structurally validate a TOML document.
    pub fn parse(raw: &str) -> Result<Config, RagLoopError> {
        let config: Config =
            toml::from_str(raw).map_err(|err| RagLoopError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), RagLoopError> {
        if config.llm.model.trim().is_empty() {
            return Err(RagLoopError::InvalidConfiguration(
                "llm.model must not be empty".into(),
            ));
        }
        if !SUPPORTED_LLM_PROVIDERS.contains(&config.llm.provider.as_str()) {
            return Err(RagLoopError::InvalidConfiguration(format!(
                "llm.provider '{}' is not supported (expected one of: {})",
                config.llm.provider,
                SUPPORTED_LLM_PROVIDERS.join(", ")
            )));
        }
        if config.llm.api_key_env.trim().is_empty() {
            return Err(RagLoopError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.evaluation.enable_web_search && config.web_search.api_key_env.trim().is_empty()
        {
            return Err(RagLoopError::InvalidConfiguration(
                "web_search.api_key_env must be set when web search is enabled".into(),
            ));
        }
        if let Err(err) = EnvFilter::try_new(&config.logging.level) {
            return Err(RagLoopError::InvalidConfiguration(format!(
                "logging.level '{}' is not a valid filter: {err}",
                config.logging.level
            )));
        }
        if config.retrieval.limit == 0 {
            return Err(RagLoopError::InvalidConfiguration(
                "retrieval.limit must be at least 1".into(),
            ));
        }
        config.evaluation.validate()
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default = "LlmConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "LlmConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "LlmConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default = "LlmConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl LlmConfig {
    fn default_provider() -> String {
        "openai".to_string()
    }

    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }

    const fn default_temperature() -> f32 {
        0.2
    }

    const fn default_timeout_ms() -> u64 {
        60_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub limit: usize,
    pub project: Option<String>,
    pub rerank: bool,
    pub rerank_top_k: Option<usize>,
    pub qdrant_url: Option<String>,
    pub qdrant_collection: String,
    pub qdrant_concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: 8,
            project: None,
            rerank: false,
            rerank_top_k: None,
            qdrant_url: None,
            qdrant_collection: "ragloop".to_string(),
            qdrant_concurrency: 8,
        }
    }
}

impl RetrievalConfig {
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            limit: self.limit,
            project: self.project.clone(),
            rerank: self.rerank,
            rerank_top_k: self.rerank_top_k,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSearchConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub max_results: usize,
    pub timeout_ms: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: TAVILY_SEARCH_URL.to_string(),
            api_key_env: "TAVILY_API_KEY".to_string(),
            max_results: 5,
            timeout_ms: 15_000,
        }
    }
}

/// Budgets for one evaluation run. Immutable for the lifetime of the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub max_iterations: usize,
    /// Initial confidence (0..=100) at or above which the loop is skipped.
    pub auto_return_confidence_threshold: f32,
    pub enable_web_search: bool,
    pub max_web_searches: usize,
    pub max_doc_queries: usize,
    /// Wall-clock bound for the whole loop; `0` disables it.
    pub deadline_ms: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            auto_return_confidence_threshold: 85.0,
            enable_web_search: false,
            max_web_searches: 2,
            max_doc_queries: 4,
            deadline_ms: 120_000,
        }
    }
}

impl EvaluationConfig {
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_ms > 0).then(|| Duration::from_millis(self.deadline_ms))
    }

    pub fn validate(&self) -> Result<(), RagLoopError> {
        if self.max_iterations == 0 {
            return Err(RagLoopError::InvalidConfiguration(
                "evaluation.max_iterations must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.auto_return_confidence_threshold) {
            return Err(RagLoopError::InvalidConfiguration(format!(
                "evaluation.auto_return_confidence_threshold must be within 0..=100, got {}",
                self.auto_return_confidence_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `warn,ragloop_core=debug`.
    pub level: String,
    /// Directory for per-run JSONL records; disabled when unset.
    pub run_log_dir: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            run_log_dir: None,
            retention_days: 90,
        }
    }
}

impl LoggingConfig {
    /// Subscriber options honouring the configured level; `RUST_LOG` still wins.
    pub fn telemetry_options(&self) -> TelemetryOptions {
        TelemetryOptions {
            env_filter: Some(self.level.clone()),
            ..TelemetryOptions::default()
        }
    }
}
