use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::action::EvaluationAction;
use crate::context::CompressedContext;
use crate::decision::Assessment;
use crate::scoring::Confidence;

/// One evaluated loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// 1-indexed, strictly increasing.
    pub step: usize,
    pub action: EvaluationAction,
    pub assessment: Assessment,
    pub current_answer: String,
    pub confidence: Confidence,
    pub memory: CompressedContext,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalAction {
    Returned,
    MaxIterations,
    Error,
}

impl FinalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalAction::Returned => "returned",
            FinalAction::MaxIterations => "max_iterations",
            FinalAction::Error => "error",
        }
    }
}

/// Calls actually issued against collaborators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub llm_calls: usize,
    pub doc_queries: usize,
    pub web_searches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationTrace {
    pub run_id: String,
    pub steps: Vec<StepResult>,
    pub final_action: FinalAction,
    pub total_duration_ms: u64,
    pub resources_used: ResourceUsage,
}

impl EvaluationTrace {
    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_trace(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceLine {
    pub index: usize,
    pub action: String,
    pub reason: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub lines: Vec<TraceLine>,
    pub final_action: Option<FinalAction>,
    pub resources_used: ResourceUsage,
}

impl TraceSummary {
    pub fn from_trace(trace: &EvaluationTrace) -> Self {
        let lines = trace
            .steps
            .iter()
            .map(|step| TraceLine {
                index: step.step,
                action: step.action.kind().as_str().to_string(),
                reason: step.action.reason().to_string(),
                duration_ms: step.duration_ms,
            })
            .collect();
        Self {
            lines,
            final_action: Some(trace.final_action),
            resources_used: trace.resources_used,
        }
    }

    pub fn render_markdown(&self) -> String {
        let mut output = String::from("### Evaluation Trace\n");
        if self.lines.is_empty() {
            output.push_str("No evaluation steps (confidence met the auto-return threshold).\n");
        }
        for line in &self.lines {
            let _ = writeln!(
                output,
                "{}. {} → {} ({} ms)",
                line.index, line.action, line.reason, line.duration_ms
            );
        }
        if let Some(final_action) = self.final_action {
            let _ = writeln!(
                output,
                "\nFinal: {} • llm calls {} • doc queries {} • web searches {}",
                final_action.as_str(),
                self.resources_used.llm_calls,
                self.resources_used.doc_queries,
                self.resources_used.web_searches
            );
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        let mut output = String::from("flowchart TD\n  start([\"initial answer\"])\n");
        for line in &self.lines {
            let label = sanitize_mermaid(&format!("{}: {}", line.action, line.reason));
            let _ = writeln!(output, "  step{}[\"{label}\"]", line.index);
        }
        let end = self.final_action.map(|a| a.as_str()).unwrap_or("unknown");
        let _ = writeln!(output, "  finish([\"{end}\"])");

        let mut previous = String::from("start");
        for line in &self.lines {
            let node = format!("step{}", line.index);
            let _ = writeln!(output, "  {previous} --> {node}");
            previous = node;
        }
        let _ = writeln!(output, "  {previous} --> finish");
        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

/// Write the trace as pretty JSON to `<dir>/<run_id>.json`.
pub fn persist_trace<P: AsRef<Path>>(dir: P, trace: &EvaluationTrace) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{}.json", trace.run_id));
    let payload = serde_json::to_vec_pretty(trace)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}
