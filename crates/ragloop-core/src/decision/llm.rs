use std::fmt::Write as _;

use async_trait::async_trait;
use tracing::debug;

use super::{DecisionInput, DecisionProvider};
use crate::action::ActionKind;
use crate::llm::DynLanguageModel;

const SYSTEM_PROMPT: &str = "You review answers produced from documentation search. \
Decide whether the current answer is good enough or which single corrective action to take next. \
Reply with exactly one JSON object and nothing else.";

/// Decision provider backed by a language model.
pub struct LlmDecisionProvider {
    model: DynLanguageModel,
}

impl LlmDecisionProvider {
    pub fn new(model: DynLanguageModel) -> Self {
        Self { model }
    }
}

fn bullet_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "{heading}:");
    for item in items {
        let _ = writeln!(out, "- {item}");
    }
}

/// Render the snapshot as a prompt. Only actions in the step's vocabulary
/// are described, so unavailable actions are never offered.
pub(crate) fn build_prompt(input: &DecisionInput) -> String {
    let mut out = String::new();
    let question = &input.question;

    let _ = writeln!(out, "## Question\n{}", question.text);
    let _ = writeln!(
        out,
        "Type: {:?}. Intent: {}. Key terms: {}\n",
        question.kind,
        question.intent,
        question.key_terms.join(", ")
    );

    let _ = writeln!(out, "## Current answer\n{}\n", input.current_answer);

    let _ = writeln!(out, "## Confidence: {:.0}/100", input.confidence.score);
    for factor in &input.confidence.factors {
        let _ = writeln!(out, "- {}: {:.0}", factor.name, factor.score);
    }
    bullet_list(&mut out, "Gaps", &input.confidence.gaps);

    let _ = writeln!(
        out,
        "\n## Indexed results\n{} result(s). Top topics: {}",
        input.results.count,
        input.results.top_topics.join("; ")
    );
    bullet_list(&mut out, "Coverage gaps", &input.results.coverage_gaps);

    if !input.web_findings.is_empty() {
        let _ = writeln!(out, "\n## Web findings");
        for finding in &input.web_findings {
            let _ = writeln!(out, "- {} ({}): {}", finding.title, finding.url, finding.snippet);
        }
    }

    match &input.memory {
        Some(memory) => {
            let _ = writeln!(out, "\n## Memory from previous steps\n{}", memory.summary);
            bullet_list(&mut out, "Established facts", &memory.established_facts);
            bullet_list(&mut out, "Still needed", &memory.still_needed);
            bullet_list(&mut out, "Queries already tried", &memory.queries_tried);
            bullet_list(&mut out, "Web searches already done", &memory.web_searches_done);
        }
        None => {
            let _ = writeln!(out, "\n## Memory from previous steps\n(first step)");
        }
    }

    let _ = writeln!(out, "\n## Available actions (step {})", input.step);
    for kind in input.vocabulary.kinds() {
        let _ = writeln!(out, "- {}: {}", kind.as_str(), kind.describe());
    }
    if input.vocabulary.contains(ActionKind::QueryMoreDocs) {
        let _ = writeln!(
            out,
            "Document queries remaining: {}",
            input.budgets.doc_queries_remaining
        );
    }
    if input.vocabulary.contains(ActionKind::SearchWeb) {
        let _ = writeln!(
            out,
            "Web searches remaining: {}",
            input.budgets.web_searches_remaining
        );
    }

    let _ = writeln!(
        out,
        r#"
## Reply format
{{"assessment": {{"answered": bool, "completeness": "complete|partial|insufficient", "issues": [string]}},
 "action": {{"type": one of the available actions, "queries": [string], "focus_areas": [string], "reason": string}},
 "memory": {{"established_facts": [string], "identified_gaps": [string], "still_needed": [string], "summary": string,
            "sources_used": [{{"url": string, "relevance": number, "contribution": string}}]}}}}"#
    );

    out
}

#[async_trait]
impl DecisionProvider for LlmDecisionProvider {
    fn name(&self) -> &str {
        "llm"
    }

    async fn decide(&self, input: &DecisionInput) -> anyhow::Result<String> {
        let prompt = build_prompt(input);
        debug!(step = input.step, prompt_chars = prompt.len(), "requesting decision");
        self.model.complete(SYSTEM_PROMPT, &prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionVocabulary, Budgets};
    use crate::decision::ResultsSummary;
    use crate::scoring::{Confidence, QuestionAnalysis};

    fn input(web_available: bool) -> DecisionInput {
        let budgets = Budgets {
            doc_queries_remaining: 2,
            web_searches_remaining: 2,
        };
        DecisionInput {
            step: 1,
            question: QuestionAnalysis::analyze("How do I configure tokio?"),
            current_answer: "Use the builder.".into(),
            confidence: Confidence::new(55.0),
            memory: None,
            vocabulary: ActionVocabulary::derive(budgets, web_available, true),
            budgets,
            results: ResultsSummary::build(["Runtime".to_string()].into_iter(), 1, &[]),
            web_findings: Vec::new(),
        }
    }

    #[test]
    fn prompt_omits_disabled_web_search() {
        let prompt = build_prompt(&input(false));
        assert!(!prompt.contains("search_web"));
        assert!(!prompt.contains("Web searches remaining"));
        assert!(prompt.contains("query_more_docs"));
        assert!(prompt.contains("(first step)"));
    }

    #[test]
    fn prompt_lists_web_search_when_available() {
        let prompt = build_prompt(&input(true));
        assert!(prompt.contains("- search_web:"));
        assert!(prompt.contains("Web searches remaining: 2"));
    }
}
