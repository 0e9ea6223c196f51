//! Immutable per-run state threaded through the evaluation loop.
//!
//! Each transition consumes the state and returns the next one, so the
//! orchestrator can keep a copy around when an in-flight step is abandoned.

use crate::action::{ActionVocabulary, Budgets};
use crate::config::EvaluationConfig;
use crate::context::{CompressedContext, Ledger, MemoryUpdate, compress};
use crate::decision::{DecisionInput, ResultsSummary, WebFinding};
use crate::retrieval::RetrievalHit;
use crate::scoring::{Confidence, QuestionAnalysis};
use crate::sources::ResultSet;
use crate::trace::ResourceUsage;

#[derive(Debug, Clone)]
pub struct EvaluationState {
    pub answer: String,
    pub confidence: Confidence,
    pub memory: Option<CompressedContext>,
    pub budgets: Budgets,
    pub ledger: Ledger,
    pub results: ResultSet,
    pub usage: ResourceUsage,
    pub warnings: Vec<String>,
}

impl EvaluationState {
    pub fn initial(
        config: &EvaluationConfig,
        answer: String,
        confidence: Confidence,
        results: Vec<RetrievalHit>,
    ) -> Self {
        let results = ResultSet::from_initial(results);
        let mut ledger = Ledger::default();
        for hit in results.indexed() {
            ledger.record_source(&hit.url, hit.score, "initial retrieval");
        }
        Self {
            answer,
            confidence,
            memory: None,
            budgets: Budgets {
                doc_queries_remaining: config.max_doc_queries,
                web_searches_remaining: config.max_web_searches,
            },
            ledger,
            results,
            usage: ResourceUsage::default(),
            warnings: Vec::new(),
        }
    }

    pub fn vocabulary(&self, web_available: bool) -> ActionVocabulary {
        ActionVocabulary::derive(self.budgets, web_available, !self.answer.trim().is_empty())
    }

    /// Build the decision-input snapshot for `step`.
    pub fn snapshot(
        &self,
        step: usize,
        question: &QuestionAnalysis,
        vocabulary: ActionVocabulary,
    ) -> DecisionInput {
        let indexed = self.results.indexed();
        DecisionInput {
            step,
            question: question.clone(),
            current_answer: self.answer.clone(),
            confidence: self.confidence.clone(),
            memory: self.memory.clone(),
            vocabulary,
            budgets: self.budgets,
            results: ResultsSummary::build(
                indexed.iter().map(|hit| hit.title.clone()),
                indexed.len(),
                &self.confidence.gaps,
            ),
            web_findings: self
                .results
                .web()
                .iter()
                .map(|result| WebFinding::new(&result.title, &result.url, &result.content))
                .collect(),
        }
    }

    pub fn record_decision_call(mut self) -> Self {
        self.usage.llm_calls += 1;
        self
    }

    /// Replace memory with the provider's proposal, then fold in the ledger.
    pub fn with_memory(mut self, proposal: Option<MemoryUpdate>) -> Self {
        self.memory = Some(compress(self.memory.as_ref(), proposal, &self.ledger));
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn used_web_search(&self) -> bool {
        !self.results.web().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;

    fn hit(url: &str) -> RetrievalHit {
        RetrievalHit {
            url: url.into(),
            title: format!("Title {url}"),
            text: String::new(),
            score: 0.4,
        }
    }

    #[test]
    fn initial_state_seeds_budgets_and_ledger() {
        let config = EvaluationConfig::default();
        let state = EvaluationState::initial(
            &config,
            "answer".into(),
            Confidence::new(40.0),
            vec![hit("docs://a"), hit("docs://a")],
        );
        assert_eq!(state.budgets.doc_queries_remaining, config.max_doc_queries);
        assert_eq!(state.ledger.sources_used().len(), 1);
        assert_eq!(state.results.len(), 1);
        assert!(state.memory.is_none());
    }

    #[test]
    fn snapshot_reflects_state() {
        let state = EvaluationState::initial(
            &EvaluationConfig::default(),
            "answer".into(),
            Confidence::new(40.0),
            vec![hit("docs://a")],
        );
        let vocabulary = state.vocabulary(false);
        let question = QuestionAnalysis::analyze("How do I do it?");
        let input = state.snapshot(1, &question, vocabulary);
        assert_eq!(input.results.count, 1);
        assert_eq!(input.results.top_topics, vec!["Title docs://a".to_string()]);
        assert!(!input.vocabulary.contains(ActionKind::SearchWeb));
    }

    #[test]
    fn memory_update_keeps_ground_truth() {
        let state = EvaluationState::initial(
            &EvaluationConfig::default(),
            "answer".into(),
            Confidence::new(40.0),
            vec![hit("docs://a")],
        )
        .with_memory(Some(MemoryUpdate::default()));
        let memory = state.memory.unwrap();
        assert_eq!(memory.sources_used[0].url, "docs://a");
    }

    #[test]
    fn trailing_slash_variants_are_one_source_everywhere() {
        let state = EvaluationState::initial(
            &EvaluationConfig::default(),
            "answer".into(),
            Confidence::new(40.0),
            vec![hit("https://d/x"), hit("https://d/x/")],
        )
        .with_memory(None);
        assert_eq!(state.results.sources().len(), 1);
        assert_eq!(state.ledger.sources_used().len(), 1);
        assert_eq!(state.memory.unwrap().sources_used.len(), 1);
    }
}
