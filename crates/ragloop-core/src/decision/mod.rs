//! Decision provider contract and the validator at its boundary.
//!
//! Providers return raw reply text. Everything they say is untrusted: the
//! reply is parsed against a strict schema and checked against the action
//! vocabulary offered at that step. A reply that fails either check is never
//! retried; the orchestrator substitutes [`Decision::fallback`].

mod llm;
mod scripted;

pub use llm::LlmDecisionProvider;
pub use scripted::{ScriptedDecisionProvider, ScriptedReply};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::{ActionKind, ActionVocabulary, Budgets, EvaluationAction};
use crate::context::{CompressedContext, MemoryUpdate};
use crate::error::DecisionError;
use crate::scoring::{Confidence, QuestionAnalysis};

pub const FALLBACK_REASON: &str = "decision unavailable, returning current answer";

const TOP_TOPICS: usize = 5;
const WEB_SNIPPET_CHARS: usize = 300;

/// Summary of the indexed results the answer currently rests on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultsSummary {
    pub count: usize,
    pub top_topics: Vec<String>,
    pub coverage_gaps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebFinding {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Snapshot handed to the decision provider at each step.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionInput {
    pub step: usize,
    pub question: QuestionAnalysis,
    pub current_answer: String,
    pub confidence: Confidence,
    pub memory: Option<CompressedContext>,
    pub vocabulary: ActionVocabulary,
    pub budgets: Budgets,
    pub results: ResultsSummary,
    pub web_findings: Vec<WebFinding>,
}

impl ResultsSummary {
    pub fn build(titles: impl Iterator<Item = String>, count: usize, gaps: &[String]) -> Self {
        Self {
            count,
            top_topics: titles
                .filter(|title| !title.trim().is_empty())
                .take(TOP_TOPICS)
                .collect(),
            coverage_gaps: gaps.to_vec(),
        }
    }
}

impl WebFinding {
    pub fn new(title: &str, url: &str, content: &str) -> Self {
        Self {
            title: title.to_string(),
            url: url.to_string(),
            snippet: content.chars().take(WEB_SNIPPET_CHARS).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    #[default]
    Partial,
    Insufficient,
}

/// The provider's judgement of the current answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(default)]
    pub answered: bool,
    #[serde(default)]
    pub completeness: Completeness,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// A validated decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: EvaluationAction,
    pub assessment: Assessment,
    pub memory: Option<MemoryUpdate>,
}

impl Decision {
    /// The mandatory fail-safe used whenever a reply cannot be trusted.
    pub fn fallback() -> Self {
        Self {
            action: EvaluationAction::return_answer(FALLBACK_REASON),
            assessment: Assessment::default(),
            memory: None,
        }
    }
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str {
        "decision-provider"
    }

    /// Produce a raw reply for the snapshot. The reply is validated by
    /// [`parse_decision`]; errors are treated like malformed replies.
    async fn decide(&self, input: &DecisionInput) -> anyhow::Result<String>;
}

pub type DynDecisionProvider = Arc<dyn DecisionProvider>;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DecisionWire {
    action: ActionWire,
    #[serde(default)]
    assessment: Option<Assessment>,
    #[serde(default, alias = "memory_update")]
    memory: Option<MemoryUpdate>,
}

#[derive(Deserialize)]
struct ActionWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    focus_areas: Vec<String>,
    #[serde(default)]
    reason: String,
}

/// Slice out the outermost JSON object, tolerating code fences and prose.
fn extract_json(reply: &str) -> Option<&str> {
    match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&reply[start..=end]),
        _ => None,
    }
}

fn clean(values: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !cleaned.iter().any(|known| known == value) {
            cleaned.push(value.to_string());
        }
    }
    cleaned
}

/// Validate a raw reply against the schema and the step's vocabulary.
pub fn parse_decision(
    reply: &str,
    vocabulary: &ActionVocabulary,
) -> Result<Decision, DecisionError> {
    let json = extract_json(reply).ok_or(DecisionError::MissingJson)?;
    let wire: DecisionWire =
        serde_json::from_str(json).map_err(|err| DecisionError::Malformed(err.to_string()))?;

    let kind = ActionKind::parse(&wire.action.kind)
        .ok_or_else(|| DecisionError::UnknownAction(wire.action.kind.clone()))?;
    if !vocabulary.contains(kind) {
        return Err(DecisionError::UnavailableAction(kind));
    }

    let reason = wire.action.reason.trim().to_string();
    let action = match kind {
        ActionKind::ReturnAnswer => EvaluationAction::ReturnAnswer { reason },
        ActionKind::QueryMoreDocs | ActionKind::SearchWeb => {
            let queries = clean(wire.action.queries);
            if queries.is_empty() {
                return Err(DecisionError::EmptyQueries(kind));
            }
            if kind == ActionKind::QueryMoreDocs {
                EvaluationAction::QueryMoreDocs { queries, reason }
            } else {
                EvaluationAction::SearchWeb { queries, reason }
            }
        }
        ActionKind::RefineAnswer => EvaluationAction::RefineAnswer {
            focus_areas: clean(wire.action.focus_areas),
            reason,
        },
    };

    Ok(Decision {
        action,
        assessment: wire.assessment.unwrap_or_default(),
        memory: wire.memory,
    })
}

/// Render a decision in the wire format `parse_decision` accepts.
pub fn render_reply(action: &EvaluationAction, memory: Option<&MemoryUpdate>) -> String {
    let mut reply = serde_json::json!({
        "action": action,
        "assessment": Assessment::default(),
    });
    if let Some(memory) = memory {
        reply["memory"] = serde_json::to_value(memory).unwrap_or_default();
    }
    reply.to_string()
}
