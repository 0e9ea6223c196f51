//! Question analysis and confidence scoring collaborators.
//!
//! Both run once, before the evaluation loop. The loop itself never
//! re-scores: it carries the initial [`Confidence`] through to the output.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::retrieval::{RetrievalHit, tokenize};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "what", "how", "why", "does", "can", "should", "from", "into",
    "when", "which", "that", "this", "are", "use", "using", "there", "about", "have", "you",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    HowTo,
    Conceptual,
    Troubleshooting,
    Comparison,
    Factual,
}

/// Upstream analysis of the user question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnalysis {
    pub text: String,
    pub kind: QuestionKind,
    pub intent: String,
    pub key_terms: Vec<String>,
}

impl QuestionAnalysis {
    /// Keyword heuristics; good enough to steer retrieval and scoring.
    pub fn analyze(text: &str) -> Self {
        let lower = text.to_lowercase();
        let kind = if ["error", "fail", "panic", "broken", "not working"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            QuestionKind::Troubleshooting
        } else if [" vs ", "versus", "difference between", "compare"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            QuestionKind::Comparison
        } else if lower.starts_with("how") {
            QuestionKind::HowTo
        } else if lower.starts_with("why") || lower.starts_with("what is") {
            QuestionKind::Conceptual
        } else {
            QuestionKind::Factual
        };

        let intent = match kind {
            QuestionKind::HowTo => "step-by-step instructions",
            QuestionKind::Conceptual => "explanation of a concept",
            QuestionKind::Troubleshooting => "diagnose and fix a problem",
            QuestionKind::Comparison => "compare alternatives",
            QuestionKind::Factual => "specific fact lookup",
        };

        let key_terms = tokenize(text)
            .into_iter()
            .filter(|term| !STOPWORDS.contains(&term.as_str()))
            .collect();

        Self {
            text: text.to_string(),
            kind,
            intent: intent.to_string(),
            key_terms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactor {
    pub name: String,
    pub score: f32,
}

/// Confidence breakdown on a 0..=100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    pub score: f32,
    #[serde(default)]
    pub factors: Vec<ConfidenceFactor>,
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default)]
    pub explanation: String,
}

impl Confidence {
    pub fn new(score: f32) -> Self {
        Self {
            score: score.clamp(0.0, 100.0),
            factors: Vec::new(),
            gaps: Vec::new(),
            explanation: String::new(),
        }
    }
}

pub trait ConfidenceScorer: Send + Sync {
    fn score(
        &self,
        question: &QuestionAnalysis,
        results: &[RetrievalHit],
        answer: &str,
    ) -> Confidence;
}

pub type DynScorer = Arc<dyn ConfidenceScorer>;

/// Weighted blend of top relevance, key-term coverage and result depth.
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    pub relevance_weight: f32,
    pub coverage_weight: f32,
    pub depth_weight: f32,
    /// Number of hits at which the depth factor saturates.
    pub depth_target: usize,
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self {
            relevance_weight: 0.5,
            coverage_weight: 0.3,
            depth_weight: 0.2,
            depth_target: 5,
        }
    }
}

impl ConfidenceScorer for HeuristicScorer {
    fn score(
        &self,
        question: &QuestionAnalysis,
        results: &[RetrievalHit],
        answer: &str,
    ) -> Confidence {
        if results.is_empty() || answer.trim().is_empty() {
            return Confidence {
                score: 0.0,
                factors: Vec::new(),
                gaps: question.key_terms.clone(),
                explanation: "no supporting documents were retrieved".to_string(),
            };
        }

        let relevance = results
            .iter()
            .map(|hit| hit.score)
            .fold(0.0_f32, f32::max)
            .clamp(0.0, 1.0)
            * 100.0;

        let corpus: HashSet<String> = results
            .iter()
            .flat_map(|hit| tokenize(&format!("{} {}", hit.title, hit.text)))
            .collect();
        let gaps: Vec<String> = question
            .key_terms
            .iter()
            .filter(|term| !corpus.contains(term.as_str()))
            .cloned()
            .collect();
        let coverage = if question.key_terms.is_empty() {
            100.0
        } else {
            100.0 * (question.key_terms.len() - gaps.len()) as f32
                / question.key_terms.len() as f32
        };

        let depth =
            100.0 * results.len().min(self.depth_target) as f32 / self.depth_target.max(1) as f32;

        let score = relevance * self.relevance_weight
            + coverage * self.coverage_weight
            + depth * self.depth_weight;

        Confidence {
            score: score.clamp(0.0, 100.0),
            factors: vec![
                ConfidenceFactor {
                    name: "top_relevance".into(),
                    score: relevance,
                },
                ConfidenceFactor {
                    name: "term_coverage".into(),
                    score: coverage,
                },
                ConfidenceFactor {
                    name: "result_depth".into(),
                    score: depth,
                },
            ],
            explanation: format!(
                "{} result(s), {} of {} key term(s) covered",
                results.len(),
                question.key_terms.len() - gaps.len(),
                question.key_terms.len()
            ),
            gaps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(text: &str, score: f32) -> RetrievalHit {
        RetrievalHit {
            url: format!("docs://{text}"),
            title: String::new(),
            text: text.to_string(),
            score,
        }
    }

    #[test]
    fn analysis_classifies_common_shapes() {
        assert_eq!(
            QuestionAnalysis::analyze("How do I configure the runtime?").kind,
            QuestionKind::HowTo
        );
        assert_eq!(
            QuestionAnalysis::analyze("Build fails with linker error").kind,
            QuestionKind::Troubleshooting
        );
        let analysis = QuestionAnalysis::analyze("What is the difference between mpsc vs broadcast?");
        assert_eq!(analysis.kind, QuestionKind::Comparison);
        assert!(analysis.key_terms.contains(&"broadcast".to_string()));
        assert!(!analysis.key_terms.contains(&"what".to_string()));
    }

    #[test]
    fn empty_results_score_zero_with_all_terms_as_gaps() {
        let question = QuestionAnalysis::analyze("configure tokio runtime");
        let confidence = HeuristicScorer::default().score(&question, &[], "answer");
        assert_eq!(confidence.score, 0.0);
        assert_eq!(confidence.gaps, question.key_terms);
    }

    #[test]
    fn uncovered_terms_become_gaps() {
        let question = QuestionAnalysis::analyze("configure tokio runtime");
        let results = vec![hit("tokio runtime builder", 0.9), hit("tokio tasks", 0.4)];
        let confidence = HeuristicScorer::default().score(&question, &results, "use the builder");
        assert_eq!(confidence.gaps, vec!["configure".to_string()]);
        assert!(confidence.score > 0.0 && confidence.score < 100.0);
        assert_eq!(confidence.factors.len(), 3);
    }
}
