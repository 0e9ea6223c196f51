use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

use crate::output::EvaluationOutput;

const RUN_LOG_FILE: &str = "runs.jsonl";
const AUDIT_LOG_FILE: &str = "audit.jsonl";
const ANSWER_EXCERPT_CHARS: usize = 500;

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("api_key", r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("secret", r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("bearer", r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)"),
        ("sk_token", r"(sk-[A-Za-z0-9]{16,})"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|regex| (name, regex)))
    .collect()
});

/// One line of `runs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogRecord {
    pub timestamp: String,
    pub run_id: String,
    pub question: String,
    pub answer_excerpt: String,
    pub final_action: String,
    pub steps: usize,
    pub llm_calls: usize,
    pub doc_queries: usize,
    pub web_searches: usize,
    pub used_web_search: bool,
    pub initial_confidence: f32,
    pub duration_ms: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub trace_path: Option<String>,
    #[serde(default)]
    pub redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord<'a> {
    timestamp: &'a str,
    run_id: &'a str,
    redactions: &'a [String],
}

/// Where and for how long run records are kept.
#[derive(Debug, Clone)]
pub struct RunLogSettings {
    pub dir: PathBuf,
    /// `0` keeps records forever.
    pub retention_days: u64,
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{line}")
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert(name.to_string());
        }
    }
    output
}

/// Append a redacted record of `output` to the month's run log and return
/// the file written.
pub fn log_evaluation_run(
    settings: &RunLogSettings,
    question: &str,
    output: &EvaluationOutput,
    trace_path: Option<&Path>,
) -> Result<PathBuf> {
    let timestamp = Utc::now();
    let mut redactions = BTreeSet::new();
    let trace = &output.trace;

    let excerpt: String = output.answer.chars().take(ANSWER_EXCERPT_CHARS).collect();
    let record = RunLogRecord {
        timestamp: timestamp.to_rfc3339(),
        run_id: trace.run_id.clone(),
        question: sanitize_text(question, &mut redactions),
        answer_excerpt: sanitize_text(&excerpt, &mut redactions),
        final_action: trace.final_action.as_str().to_string(),
        steps: trace.steps.len(),
        llm_calls: trace.resources_used.llm_calls,
        doc_queries: trace.resources_used.doc_queries,
        web_searches: trace.resources_used.web_searches,
        used_web_search: output.used_web_search,
        initial_confidence: output.confidence.score,
        duration_ms: trace.total_duration_ms,
        warnings: output
            .warnings
            .iter()
            .map(|warning| sanitize_text(warning, &mut redactions))
            .collect(),
        sources: output
            .sources
            .iter()
            .map(|source| sanitize_text(&source.url, &mut redactions))
            .collect(),
        trace_path: trace_path.map(|path| path.display().to_string()),
        redactions: redactions.into_iter().collect(),
    };

    let month_dir = settings
        .dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    let run_log_path = month_dir.join(RUN_LOG_FILE);
    append_json_line(&run_log_path, &record)?;

    if !record.redactions.is_empty() {
        let audit = AuditLogRecord {
            timestamp: &record.timestamp,
            run_id: &record.run_id,
            redactions: &record.redactions,
        };
        append_json_line(&month_dir.join(AUDIT_LOG_FILE), &audit)?;
        warn!(
            run_id = %record.run_id,
            fields = ?record.redactions,
            "redacted potential secrets from run log"
        );
    }

    enforce_retention(&settings.dir, settings.retention_days)?;

    Ok(run_log_path)
}

fn enforce_retention(base_dir: &Path, retention_days: u64) -> Result<()> {
    if retention_days == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(base_dir, cutoff)
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }

    Ok(())
}
