//! Answer synthesis and refinement collaborators.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::llm::DynLanguageModel;
use crate::retrieval::RetrievalHit;
use crate::scoring::QuestionAnalysis;
use crate::sources::ContextSnippet;

const SNIPPET_CHARS: usize = 1_500;

const SYNTHESIS_PROMPT: &str = "You answer questions about software documentation. \
Use only the provided excerpts, cite sources by URL, and say so when the excerpts do not cover something.";

const REFINE_PROMPT: &str = "You improve an existing answer about software documentation. \
Keep what is correct, fix what is wrong, address the focus areas, and cite sources by URL.";

/// Everything the refiner needs to revise the current answer.
#[derive(Debug, Clone, Serialize)]
pub struct RefineRequest {
    pub original_query: String,
    pub current_answer: String,
    pub focus_areas: Vec<String>,
    pub additional_context: Vec<ContextSnippet>,
    pub previous_memory_summary: String,
}

#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        question: &QuestionAnalysis,
        results: &[RetrievalHit],
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait AnswerRefiner: Send + Sync {
    async fn refine(&self, request: &RefineRequest) -> anyhow::Result<String>;
}

pub type DynSynthesizer = Arc<dyn AnswerSynthesizer>;
pub type DynRefiner = Arc<dyn AnswerRefiner>;

/// Synthesizer and refiner backed by one language model.
pub struct LlmAnswerWriter {
    model: DynLanguageModel,
}

impl LlmAnswerWriter {
    pub fn new(model: DynLanguageModel) -> Self {
        Self { model }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

fn synthesis_prompt(question: &QuestionAnalysis, results: &[RetrievalHit]) -> String {
    let mut out = format!("Question: {}\n\nExcerpts:\n", question.text);
    if results.is_empty() {
        out.push_str("(no documents matched)\n");
    }
    for (idx, hit) in results.iter().enumerate() {
        let _ = writeln!(
            out,
            "[{}] {} <{}>\n{}\n",
            idx + 1,
            hit.title,
            hit.url,
            excerpt(&hit.text)
        );
    }
    out
}

fn refine_prompt(request: &RefineRequest) -> String {
    let mut out = format!(
        "Question: {}\n\nCurrent answer:\n{}\n",
        request.original_query, request.current_answer
    );
    if !request.focus_areas.is_empty() {
        let _ = writeln!(out, "\nFocus areas:");
        for area in &request.focus_areas {
            let _ = writeln!(out, "- {area}");
        }
    }
    if !request.previous_memory_summary.trim().is_empty() {
        let _ = writeln!(out, "\nReview notes: {}", request.previous_memory_summary);
    }
    if !request.additional_context.is_empty() {
        let _ = writeln!(out, "\nAdditional material:");
        for snippet in &request.additional_context {
            let _ = writeln!(
                out,
                "- {} <{}> ({:?})\n{}\n",
                snippet.title,
                snippet.url,
                snippet.kind,
                excerpt(&snippet.text)
            );
        }
    }
    out.push_str("\nWrite the improved answer only.");
    out
}

#[async_trait]
impl AnswerSynthesizer for LlmAnswerWriter {
    async fn synthesize(
        &self,
        question: &QuestionAnalysis,
        results: &[RetrievalHit],
    ) -> anyhow::Result<String> {
        self.model
            .complete(SYNTHESIS_PROMPT, &synthesis_prompt(question, results))
            .await
    }
}

#[async_trait]
impl AnswerRefiner for LlmAnswerWriter {
    async fn refine(&self, request: &RefineRequest) -> anyhow::Result<String> {
        self.model
            .complete(REFINE_PROMPT, &refine_prompt(request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LanguageModel;
    use crate::sources::SourceKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct EchoModel {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn complete(&self, _system: &str, prompt: &str) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok("revised".to_string())
        }
    }

    #[tokio::test]
    async fn refine_prompt_carries_focus_and_material() {
        let model = Arc::new(EchoModel::default());
        let writer = LlmAnswerWriter::new(model.clone());
        let request = RefineRequest {
            original_query: "How do I spawn tasks?".into(),
            current_answer: "Use spawn.".into(),
            focus_areas: vec!["JoinHandle usage".into()],
            additional_context: vec![ContextSnippet {
                kind: SourceKind::Web,
                url: "https://tokio.rs/spawn".into(),
                title: "Spawning".into(),
                text: "tokio::spawn returns a JoinHandle".into(),
                score: 0.8,
            }],
            previous_memory_summary: "example missing".into(),
        };

        let answer = writer.refine(&request).await.unwrap();
        assert_eq!(answer, "revised");

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("- JoinHandle usage"));
        assert!(prompts[0].contains("https://tokio.rs/spawn"));
        assert!(prompts[0].contains("Review notes: example missing"));
    }

    #[test]
    fn synthesis_prompt_marks_empty_results() {
        let question = QuestionAnalysis::analyze("What is a runtime?");
        assert!(synthesis_prompt(&question, &[]).contains("(no documents matched)"));
    }
}
