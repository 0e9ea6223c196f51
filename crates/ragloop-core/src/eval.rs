use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RunLogEntry {
    pub run_id: Option<String>,
    pub final_action: String,
    #[serde(default)]
    pub steps: usize,
    #[serde(default)]
    pub llm_calls: usize,
    #[serde(default)]
    pub used_web_search: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Aggregate statistics over a run log.
#[derive(Debug, Default, Clone)]
pub struct RunLogStats {
    pub total_runs: usize,
    /// Runs answered without entering the loop.
    pub fast_path_returns: usize,
    pub by_final_action: BTreeMap<String, usize>,
    pub mean_steps: f32,
    pub mean_llm_calls: f32,
    pub web_search_runs: usize,
    /// Runs that ended in `error`.
    pub failures: Vec<String>,
}

impl RunLogStats {
    pub fn record(&mut self, entry: &RunLogEntry) {
        self.total_runs += 1;
        let n = self.total_runs as f32;
        self.mean_steps = (self.mean_steps * (n - 1.0) + entry.steps as f32) / n;
        self.mean_llm_calls = (self.mean_llm_calls * (n - 1.0) + entry.llm_calls as f32) / n;

        if entry.final_action == "returned" && entry.steps == 0 {
            self.fast_path_returns += 1;
        }
        if entry.used_web_search {
            self.web_search_runs += 1;
        }
        *self
            .by_final_action
            .entry(entry.final_action.clone())
            .or_default() += 1;
        if entry.final_action == "error" {
            if let Some(id) = &entry.run_id {
                self.failures.push(id.clone());
            }
        }
    }

    pub fn summary(&self) -> String {
        let actions = self
            .by_final_action
            .iter()
            .map(|(action, count)| format!("{action} {count}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} run(s) • {} fast-path • {} • avg steps {:.2} • avg llm calls {:.2} • {} with web search",
            self.total_runs,
            self.fast_path_returns,
            if actions.is_empty() { "no outcomes".to_string() } else { actions },
            self.mean_steps,
            self.mean_llm_calls,
            self.web_search_runs
        )
    }
}

pub struct RunLogAnalyzer;

impl RunLogAnalyzer {
    pub fn analyze(path: impl AsRef<Path>) -> Result<RunLogStats> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("failed to open run log {}", path.as_ref().display()))?;
        let mut stats = RunLogStats::default();

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunLogEntry>(&line) {
                Ok(entry) => stats.record(&entry),
                Err(err) => {
                    tracing::debug!(%err, "skipping malformed run log entry");
                }
            }
        }

        Ok(stats)
    }
}
