use serde::{Deserialize, Serialize};

use crate::scoring::Confidence;
use crate::sources::SourceRef;
use crate::trace::EvaluationTrace;

/// Final result of one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutput {
    pub answer: String,
    pub confidence: Confidence,
    pub trace: EvaluationTrace,
    /// Every distinct source merged during the run, initial results first.
    pub sources: Vec<SourceRef>,
    pub used_web_search: bool,
    pub warnings: Vec<String>,
}

impl EvaluationOutput {
    pub fn step_count(&self) -> usize {
        self.trace.steps.len()
    }

    /// Render the answer followed by its sources, the way the CLI prints it.
    pub fn render_markdown(&self) -> String {
        let mut out = format!("{}\n", self.answer.trim_end());
        if !self.sources.is_empty() {
            out.push_str("\n### Sources\n");
            for source in &self.sources {
                let label = if source.title.is_empty() {
                    &source.url
                } else {
                    &source.title
                };
                out.push_str(&format!("- [{label}]({})\n", source.url));
            }
        }
        if !self.warnings.is_empty() {
            out.push_str("\n### Warnings\n");
            for warning in &self.warnings {
                out.push_str(&format!("- {warning}\n"));
            }
        }
        out
    }
}
