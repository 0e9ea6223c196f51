//! End-to-end question answering: initial retrieval and synthesis followed by
//! the evaluation loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::RagLoopError;
use crate::answer::{DynSynthesizer, LlmAnswerWriter};
use crate::config::{Config, EvaluationConfig};
use crate::decision::LlmDecisionProvider;
use crate::llm::{DynLanguageModel, OpenAiChatModel};
use crate::logging::{RunLogSettings, log_evaluation_run};
use crate::orchestrator::{AnswerEvaluator, Collaborators, EvaluationRequest};
use crate::output::EvaluationOutput;
use crate::retrieval::DynRetriever;
use crate::scoring::{DynScorer, HeuristicScorer, QuestionAnalysis};
use crate::security::require_env;
use crate::web::{TavilySearch, WebSearchOptions};

pub struct AnswerPipeline {
    synthesizer: DynSynthesizer,
    scorer: DynScorer,
    collaborators: Collaborators,
    evaluator: AnswerEvaluator,
    run_log: Option<RunLogSettings>,
}

impl AnswerPipeline {
    pub fn new(
        config: EvaluationConfig,
        collaborators: Collaborators,
        synthesizer: DynSynthesizer,
        scorer: DynScorer,
    ) -> Self {
        Self {
            synthesizer,
            scorer,
            evaluator: AnswerEvaluator::new(config, collaborators.clone()),
            collaborators,
            run_log: None,
        }
    }

    pub fn with_run_log(mut self, settings: RunLogSettings) -> Self {
        self.run_log = Some(settings);
        self
    }

    /// Wire the LLM-backed collaborators described by `config` around
    /// `retriever`. Web search is left out, with a warning, when its key is
    /// not available.
    pub fn from_config(config: &Config, retriever: DynRetriever) -> Result<Self, RagLoopError> {
        let llm = &config.llm;
        // Every provider accepted by `ConfigLoader` speaks the OpenAI chat API.
        let model: DynLanguageModel = Arc::new(
            OpenAiChatModel::new(
                llm.base_url.clone(),
                llm.model.clone(),
                require_env(&llm.api_key_env)?,
                llm.timeout(),
            )?
            .with_temperature(llm.temperature),
        );
        let writer = Arc::new(LlmAnswerWriter::new(model.clone()));

        let mut collaborators = Collaborators::new(
            Arc::new(LlmDecisionProvider::new(model)),
            retriever,
            writer.clone(),
        )
        .with_search_options(config.retrieval.search_options())
        .with_web_options(WebSearchOptions {
            max_results: config.web_search.max_results,
        });

        if config.evaluation.enable_web_search {
            match require_env(&config.web_search.api_key_env) {
                Ok(key) => {
                    let search = TavilySearch::new(
                        key,
                        Duration::from_millis(config.web_search.timeout_ms),
                    )?
                    .with_endpoint(config.web_search.endpoint.clone());
                    collaborators = collaborators.with_web(Arc::new(search));
                }
                Err(err) => {
                    warn!(error = %err, "web search enabled but unavailable; continuing without it");
                }
            }
        }

        let mut pipeline = Self::new(
            config.evaluation,
            collaborators,
            writer,
            Arc::new(HeuristicScorer::default()),
        );
        if let Some(dir) = &config.logging.run_log_dir {
            pipeline = pipeline.with_run_log(RunLogSettings {
                dir: dir.clone(),
                retention_days: config.logging.retention_days,
            });
        }
        Ok(pipeline)
    }

    pub fn evaluator(&self) -> &AnswerEvaluator {
        &self.evaluator
    }

    /// Answer `question`. Failures before the loop starts are returned as
    /// errors; the loop itself always produces an output.
    #[instrument(name = "pipeline.answer", skip(self))]
    pub async fn answer(&self, question: &str) -> Result<EvaluationOutput> {
        let analysis = QuestionAnalysis::analyze(question);
        let initial_results = self
            .collaborators
            .retriever
            .search(question, &self.collaborators.search_options)
            .await
            .context("initial retrieval failed")?;
        let initial_answer = self
            .synthesizer
            .synthesize(&analysis, &initial_results)
            .await
            .context("initial synthesis failed")?;
        let initial_confidence = self
            .scorer
            .score(&analysis, &initial_results, &initial_answer);
        info!(
            results = initial_results.len(),
            confidence = initial_confidence.score,
            "initial answer ready"
        );

        let output = self
            .evaluator
            .evaluate(EvaluationRequest {
                question: analysis,
                initial_answer,
                initial_confidence,
                initial_results,
            })
            .await;

        if let Some(settings) = &self.run_log {
            if let Err(err) = log_evaluation_run(settings, question, &output, None) {
                warn!(error = %err, "failed to write run log");
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::EvaluationAction;
    use crate::answer::{AnswerRefiner, AnswerSynthesizer, RefineRequest};
    use crate::decision::ScriptedDecisionProvider;
    use crate::retrieval::{IngestDocument, InMemoryRetriever, RetrievalHit};
    use crate::trace::FinalAction;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedWriter;

    #[async_trait]
    impl AnswerSynthesizer for FixedWriter {
        async fn synthesize(
            &self,
            _question: &QuestionAnalysis,
            results: &[RetrievalHit],
        ) -> Result<String> {
            Ok(format!("answer from {} document(s)", results.len()))
        }
    }

    #[async_trait]
    impl AnswerRefiner for FixedWriter {
        async fn refine(&self, request: &RefineRequest) -> Result<String> {
            Ok(format!("{} (refined)", request.current_answer))
        }
    }

    fn pipeline(config: EvaluationConfig, decisions: Vec<EvaluationAction>) -> AnswerPipeline {
        let retriever = InMemoryRetriever::new();
        retriever.ingest(
            None,
            vec![IngestDocument {
                id: "1".into(),
                url: "docs://runtime".into(),
                title: "Tokio runtime".into(),
                text: "The runtime drives async tasks and timers.".into(),
            }],
        );
        let writer = Arc::new(FixedWriter);
        let collaborators = Collaborators::new(
            Arc::new(ScriptedDecisionProvider::from_actions(decisions)),
            Arc::new(retriever),
            writer.clone(),
        );
        AnswerPipeline::new(
            config,
            collaborators,
            writer,
            Arc::new(HeuristicScorer::default()),
        )
    }

    #[tokio::test]
    async fn answer_runs_loop_and_refines() {
        let config = EvaluationConfig {
            auto_return_confidence_threshold: 100.0,
            ..EvaluationConfig::default()
        };
        let pipeline = pipeline(
            config,
            vec![
                EvaluationAction::RefineAnswer {
                    focus_areas: vec!["timers".into()],
                    reason: "thin".into(),
                },
                EvaluationAction::return_answer("done"),
            ],
        );

        let output = pipeline.answer("How does the tokio runtime work?").await.unwrap();
        assert_eq!(output.answer, "answer from 1 document(s) (refined)");
        assert_eq!(output.trace.final_action, FinalAction::Returned);
        assert_eq!(output.trace.resources_used.llm_calls, 3);
        assert_eq!(output.sources[0].url, "docs://runtime");
    }

    #[tokio::test]
    async fn confident_answer_skips_loop_and_logs_run() {
        let config = EvaluationConfig {
            auto_return_confidence_threshold: 0.0,
            ..EvaluationConfig::default()
        };
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(config, Vec::new()).with_run_log(RunLogSettings {
            dir: temp.path().to_path_buf(),
            retention_days: 0,
        });

        let output = pipeline.answer("What drives async tasks?").await.unwrap();
        assert!(output.trace.steps.is_empty());
        assert_eq!(output.trace.resources_used.llm_calls, 0);

        let year = temp.path().read_dir().unwrap().next().unwrap().unwrap().path();
        let month = year.read_dir().unwrap().next().unwrap().unwrap().path();
        assert!(month.join("runs.jsonl").exists());
    }
}
