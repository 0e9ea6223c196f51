//! Bounded, self-correcting evaluation loop.
//!
//! Each step asks the decision provider for one action, executes it, and
//! folds the outcome into the run state. The loop ends when the provider
//! returns the answer, when the iteration limit is hit, or when the deadline
//! passes. It never fails: collaborator errors degrade into warnings and the
//! best answer known so far is returned.

use std::future::Future;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::action::EvaluationAction;
use crate::answer::DynRefiner;
use crate::config::EvaluationConfig;
use crate::context::compress;
use crate::decision::{Decision, DynDecisionProvider, parse_decision};
use crate::executor::{self, Dispatch};
use crate::metrics::record_evaluation_metrics;
use crate::output::EvaluationOutput;
use crate::retrieval::{DynRetriever, RetrievalHit, SearchOptions};
use crate::scoring::{Confidence, QuestionAnalysis};
use crate::state::EvaluationState;
use crate::trace::{EvaluationTrace, FinalAction, StepResult};
use crate::web::{DynWebSearch, WebSearchOptions};

/// Injected collaborators for the loop.
#[derive(Clone)]
pub struct Collaborators {
    pub decision: DynDecisionProvider,
    pub retriever: DynRetriever,
    /// `None` disables web search regardless of configuration.
    pub web: Option<DynWebSearch>,
    pub refiner: DynRefiner,
    pub search_options: SearchOptions,
    pub web_options: WebSearchOptions,
}

impl Collaborators {
    pub fn new(
        decision: DynDecisionProvider,
        retriever: DynRetriever,
        refiner: DynRefiner,
    ) -> Self {
        Self {
            decision,
            retriever,
            web: None,
            refiner,
            search_options: SearchOptions::default(),
            web_options: WebSearchOptions::default(),
        }
    }

    pub fn with_web(mut self, web: DynWebSearch) -> Self {
        self.web = Some(web);
        self
    }

    pub fn with_search_options(mut self, options: SearchOptions) -> Self {
        self.search_options = options;
        self
    }

    pub fn with_web_options(mut self, options: WebSearchOptions) -> Self {
        self.web_options = options;
        self
    }
}

/// The initial answer and the material it was built from.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub question: QuestionAnalysis,
    pub initial_answer: String,
    pub initial_confidence: Confidence,
    pub initial_results: Vec<RetrievalHit>,
}

pub struct AnswerEvaluator {
    config: EvaluationConfig,
    collaborators: Collaborators,
}

/// Run `future`, giving up at `deadline` if one is set.
async fn within<F: Future>(
    deadline: Option<tokio::time::Instant>,
    future: F,
) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl AnswerEvaluator {
    pub fn new(config: EvaluationConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Web search is offered only when enabled and a service is wired in.
    pub fn web_available(&self) -> bool {
        self.config.enable_web_search && self.collaborators.web.is_some()
    }

    pub async fn evaluate(&self, request: EvaluationRequest) -> EvaluationOutput {
        let run_id = Uuid::new_v4().to_string();
        self.run(run_id, request).await
    }

    #[instrument(name = "evaluation.run", skip(self, request), fields(question = %request.question.text))]
    async fn run(&self, run_id: String, request: EvaluationRequest) -> EvaluationOutput {
        let started = Instant::now();
        let deadline = self
            .config
            .deadline()
            .map(|budget| tokio::time::Instant::now() + budget);
        let web_available = self.web_available();

        let mut state = EvaluationState::initial(
            &self.config,
            request.initial_answer,
            request.initial_confidence,
            request.initial_results,
        );
        let mut steps: Vec<StepResult> = Vec::new();

        if state.confidence.score >= self.config.auto_return_confidence_threshold {
            info!(
                score = state.confidence.score,
                threshold = self.config.auto_return_confidence_threshold,
                "initial confidence meets threshold, skipping evaluation"
            );
            return self.finish(run_id, state, steps, FinalAction::Returned, started);
        }

        let mut final_action = FinalAction::MaxIterations;
        for step in 1..=self.config.max_iterations {
            let step_started = Instant::now();
            let vocabulary = state.vocabulary(web_available);
            let input = state.snapshot(step, &request.question, vocabulary.clone());
            state = state.record_decision_call();

            let provider = &self.collaborators.decision;
            let Some(reply) = within(deadline, provider.decide(&input)).await else {
                state = state.with_warning(self.deadline_warning());
                final_action = FinalAction::Error;
                break;
            };

            let decision = match reply {
                Ok(raw) => match parse_decision(&raw, &vocabulary) {
                    Ok(decision) => decision,
                    Err(err) => {
                        warn!(step, error = %err, "rejected decision reply");
                        state = state.with_warning(format!(
                            "step {step}: {err}; returning current answer"
                        ));
                        Decision::fallback()
                    }
                },
                Err(err) => {
                    warn!(step, provider = provider.name(), error = %err, "decision call failed");
                    state = state.with_warning(format!(
                        "step {step}: decision provider '{}' failed: {err}; returning current answer",
                        provider.name()
                    ));
                    Decision::fallback()
                }
            };

            state = state.with_memory(decision.memory);
            let mut record = StepResult {
                step,
                action: decision.action.clone(),
                assessment: decision.assessment,
                current_answer: input.current_answer,
                confidence: state.confidence.clone(),
                memory: state.memory.clone().unwrap_or_default(),
                duration_ms: 0,
            };
            debug!(step, action = %decision.action.kind(), reason = decision.action.reason(), "decision");

            if matches!(decision.action, EvaluationAction::ReturnAnswer { .. }) {
                record.duration_ms = elapsed_ms(step_started);
                steps.push(record);
                final_action = FinalAction::Returned;
                break;
            }

            let dispatch = executor::plan(&decision.action, &state, web_available);
            state = state.charge(&dispatch);
            if dispatch != Dispatch::Skip(None) {
                let outcome = within(
                    deadline,
                    executor::run(&dispatch, &state, &request.question, &self.collaborators),
                )
                .await;
                match outcome {
                    Some(outcome) => state = state.absorb(outcome),
                    None => {
                        record.duration_ms = elapsed_ms(step_started);
                        steps.push(record);
                        state = state.with_warning(self.deadline_warning());
                        final_action = FinalAction::Error;
                        break;
                    }
                }
            }

            record.duration_ms = elapsed_ms(step_started);
            steps.push(record);
        }

        // Work executed by the last step is otherwise never shown to any memory.
        if let Some(last) = steps.last_mut() {
            last.memory = compress(Some(&last.memory), None, &state.ledger);
        }

        if final_action == FinalAction::MaxIterations {
            state = state.with_warning(format!(
                "reached the iteration limit (max_iterations = {}) without a return decision",
                self.config.max_iterations
            ));
        }

        self.finish(run_id, state, steps, final_action, started)
    }

    fn deadline_warning(&self) -> String {
        warn!(deadline_ms = self.config.deadline_ms, "evaluation deadline exceeded");
        format!(
            "evaluation deadline of {} ms exceeded; returning the last known answer",
            self.config.deadline_ms
        )
    }

    fn finish(
        &self,
        run_id: String,
        state: EvaluationState,
        steps: Vec<StepResult>,
        final_action: FinalAction,
        started: Instant,
    ) -> EvaluationOutput {
        let total_duration_ms = elapsed_ms(started);
        record_evaluation_metrics(final_action, steps.len(), total_duration_ms, &state.usage);
        info!(
            final_action = final_action.as_str(),
            steps = steps.len(),
            llm_calls = state.usage.llm_calls,
            doc_queries = state.usage.doc_queries,
            web_searches = state.usage.web_searches,
            warnings = state.warnings.len(),
            duration_ms = total_duration_ms,
            "evaluation finished"
        );

        let used_web_search = state.used_web_search();
        EvaluationOutput {
            answer: state.answer,
            confidence: state.confidence,
            trace: EvaluationTrace {
                run_id,
                steps,
                final_action,
                total_duration_ms,
                resources_used: state.usage,
            },
            sources: state.results.sources().to_vec(),
            used_web_search,
            warnings: state.warnings,
        }
    }
}
