//! Action executors.
//!
//! A step is executed in three phases: [`plan`] turns the decided action into
//! a concrete [`Dispatch`], [`EvaluationState::charge`] records the calls that
//! are about to be issued, and [`run`] issues them. The outcome is folded back
//! with [`EvaluationState::absorb`]. Charging happens before any collaborator
//! is called so budgets and usage stay exact when a step is abandoned.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::action::EvaluationAction;
use crate::answer::RefineRequest;
use crate::orchestrator::Collaborators;
use crate::retrieval::RetrievalHit;
use crate::scoring::QuestionAnalysis;
use crate::state::EvaluationState;
use crate::web::WebResult;

/// Queries issued per step for either search action.
pub const MAX_QUERIES_PER_STEP: usize = 2;

/// Work a non-terminal action resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    DocQueries(Vec<String>),
    WebQueries(Vec<String>),
    Refine { focus_areas: Vec<String> },
    /// Nothing to issue; carries the warning to record, if any.
    Skip(Option<String>),
}

/// What came back from the collaborators for one dispatch.
#[derive(Debug, Default)]
pub struct Outcome {
    pub indexed: Vec<(String, Vec<RetrievalHit>)>,
    pub web: Vec<(String, Vec<WebResult>)>,
    pub answer: Option<String>,
    pub warnings: Vec<String>,
}

fn batch(queries: &[String], remaining: usize) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for query in queries {
        if selected.len() >= MAX_QUERIES_PER_STEP.min(remaining) {
            break;
        }
        if !selected.iter().any(|known| known == query) {
            selected.push(query.clone());
        }
    }
    selected
}

/// Resolve `action` against the current budgets.
pub fn plan(action: &EvaluationAction, state: &EvaluationState, web_available: bool) -> Dispatch {
    match action {
        EvaluationAction::ReturnAnswer { .. } => Dispatch::Skip(None),
        EvaluationAction::QueryMoreDocs { queries, .. } => {
            let selected = batch(queries, state.budgets.doc_queries_remaining);
            if selected.is_empty() {
                Dispatch::Skip(Some(
                    "document query requested with no budget remaining; skipped".to_string(),
                ))
            } else {
                Dispatch::DocQueries(selected)
            }
        }
        EvaluationAction::SearchWeb { queries, .. } => {
            if !web_available {
                return Dispatch::Skip(Some(
                    "web search requested while unavailable; skipped".to_string(),
                ));
            }
            let selected = batch(queries, state.budgets.web_searches_remaining);
            if selected.is_empty() {
                Dispatch::Skip(Some(
                    "web search requested with no budget remaining; skipped".to_string(),
                ))
            } else {
                Dispatch::WebQueries(selected)
            }
        }
        EvaluationAction::RefineAnswer { focus_areas, .. } => Dispatch::Refine {
            focus_areas: focus_areas.clone(),
        },
    }
}

impl EvaluationState {
    /// Account for every call `dispatch` will issue.
    pub fn charge(mut self, dispatch: &Dispatch) -> Self {
        match dispatch {
            Dispatch::DocQueries(queries) => {
                self.budgets.doc_queries_remaining =
                    self.budgets.doc_queries_remaining.saturating_sub(queries.len());
                self.usage.doc_queries += queries.len();
                for query in queries {
                    self.ledger.record_query(query);
                }
            }
            Dispatch::WebQueries(queries) => {
                self.budgets.web_searches_remaining =
                    self.budgets.web_searches_remaining.saturating_sub(queries.len());
                self.usage.web_searches += queries.len();
                for query in queries {
                    self.ledger.record_web_search(query);
                }
            }
            Dispatch::Refine { .. } => self.usage.llm_calls += 1,
            Dispatch::Skip(Some(warning)) => self.warnings.push(warning.clone()),
            Dispatch::Skip(None) => {}
        }
        self
    }

    /// Fold an outcome into the state.
    pub fn absorb(mut self, outcome: Outcome) -> Self {
        for (query, hits) in outcome.indexed {
            let added = self.results.merge_indexed(hits.clone());
            for hit in hits.iter().filter(|hit| added.iter().any(|s| s.url == hit.url)) {
                self.ledger
                    .record_source(&hit.url, hit.score, format!("indexed result for '{query}'"));
            }
        }
        for (query, results) in outcome.web {
            let added = self.results.merge_web(results.clone());
            for result in results.iter().filter(|r| added.iter().any(|s| s.url == r.url)) {
                self.ledger.record_source(
                    &result.url,
                    result.score,
                    format!("web result for '{query}'"),
                );
            }
        }
        if let Some(answer) = outcome.answer {
            self.answer = answer;
        }
        self.warnings.extend(outcome.warnings);
        self
    }
}

/// Issue the calls for `dispatch`. Per-query failures become warnings.
pub async fn run(
    dispatch: &Dispatch,
    state: &EvaluationState,
    question: &QuestionAnalysis,
    collaborators: &Collaborators,
) -> Outcome {
    let mut outcome = Outcome::default();
    match dispatch {
        Dispatch::DocQueries(queries) => {
            let retriever = &collaborators.retriever;
            let options = &collaborators.search_options;
            let searches = queries.iter().map(|query| async move {
                (query.clone(), retriever.search(query, options).await)
            });
            for (query, result) in join_all(searches).await {
                match result {
                    Ok(hits) => {
                        debug!(%query, hits = hits.len(), "document query completed");
                        outcome.indexed.push((query, hits));
                    }
                    Err(err) => {
                        warn!(%query, error = %err, "document query failed");
                        outcome
                            .warnings
                            .push(format!("document query '{query}' failed: {err}"));
                    }
                }
            }
        }
        Dispatch::WebQueries(queries) => {
            let Some(web) = collaborators.web.as_ref() else {
                outcome
                    .warnings
                    .push("web search requested without a search service; skipped".to_string());
                return outcome;
            };
            let options = &collaborators.web_options;
            let searches = queries.iter().map(|query| async move {
                (query.clone(), web.search(query, options).await)
            });
            for (query, result) in join_all(searches).await {
                match result {
                    Ok(results) => {
                        debug!(%query, results = results.len(), "web search completed");
                        outcome.web.push((query, results));
                    }
                    Err(err) => {
                        warn!(%query, error = %err, "web search failed");
                        outcome
                            .warnings
                            .push(format!("web search '{query}' failed: {err}"));
                    }
                }
            }
        }
        Dispatch::Refine { focus_areas } => {
            let request = RefineRequest {
                original_query: question.text.clone(),
                current_answer: state.answer.clone(),
                focus_areas: focus_areas.clone(),
                additional_context: state.results.additional_material(),
                previous_memory_summary: state
                    .memory
                    .as_ref()
                    .map(|memory| memory.summary.clone())
                    .unwrap_or_default(),
            };
            match collaborators.refiner.refine(&request).await {
                Ok(answer) if !answer.trim().is_empty() => outcome.answer = Some(answer),
                Ok(_) => outcome
                    .warnings
                    .push("refinement returned an empty answer; keeping the current one".into()),
                Err(err) => {
                    warn!(error = %err, "refinement failed");
                    outcome
                        .warnings
                        .push(format!("refinement failed: {err}; keeping the current answer"));
                }
            }
        }
        Dispatch::Skip(_) => {}
    }
    outcome
}
