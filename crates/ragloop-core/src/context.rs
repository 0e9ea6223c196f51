//! Compressed running memory carried between evaluation steps.
//!
//! The decision provider proposes the interpretive part (facts, gaps,
//! summary). What actually happened (queries run, searches done, URLs
//! touched) comes only from the orchestrator's [`Ledger`] and is merged in
//! append-only, so it survives a provider that forgets or invents entries.

use serde::{Deserialize, Serialize};

use crate::sources::url_key;

/// A source that contributed material during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceUsage {
    pub url: String,
    #[serde(default)]
    pub relevance: f32,
    #[serde(default)]
    pub contribution: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressedContext {
    pub established_facts: Vec<String>,
    pub identified_gaps: Vec<String>,
    pub sources_used: Vec<SourceUsage>,
    pub queries_tried: Vec<String>,
    pub web_searches_done: Vec<String>,
    pub summary: String,
    pub still_needed: Vec<String>,
}

/// Memory proposal returned by the decision provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub established_facts: Vec<String>,
    #[serde(default)]
    pub identified_gaps: Vec<String>,
    #[serde(default)]
    pub still_needed: Vec<String>,
    #[serde(default)]
    pub summary: String,
    /// Annotations for sources the provider found useful. Only URLs already
    /// present in the ledger are kept.
    #[serde(default)]
    pub sources_used: Vec<SourceUsage>,
}

/// Orchestrator-owned record of executed work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    queries_tried: Vec<String>,
    web_searches_done: Vec<String>,
    sources_used: Vec<SourceUsage>,
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

impl Ledger {
    pub fn record_query(&mut self, query: &str) {
        push_unique(&mut self.queries_tried, query);
    }

    pub fn record_web_search(&mut self, query: &str) {
        push_unique(&mut self.web_searches_done, query);
    }

    pub fn record_source(&mut self, url: &str, relevance: f32, contribution: impl Into<String>) {
        let key = url_key(url);
        if self.sources_used.iter().any(|source| url_key(&source.url) == key) {
            return;
        }
        self.sources_used.push(SourceUsage {
            url: url.to_string(),
            relevance,
            contribution: contribution.into(),
        });
    }

    pub fn queries_tried(&self) -> &[String] {
        &self.queries_tried
    }

    pub fn web_searches_done(&self) -> &[String] {
        &self.web_searches_done
    }

    pub fn sources_used(&self) -> &[SourceUsage] {
        &self.sources_used
    }
}

fn union(previous: &[String], ground_truth: &[String]) -> Vec<String> {
    let mut merged = previous.to_vec();
    for value in ground_truth {
        push_unique(&mut merged, value);
    }
    merged
}

/// Build the next memory from the previous one, the provider's proposal and
/// the ledger.
///
/// Without a proposal (fallback steps) the interpretive fields carry over
/// from `previous` unchanged.
pub fn compress(
    previous: Option<&CompressedContext>,
    proposal: Option<MemoryUpdate>,
    ledger: &Ledger,
) -> CompressedContext {
    let empty = CompressedContext::default();
    let previous = previous.unwrap_or(&empty);

    let (facts, gaps, still_needed, summary, annotations) = match proposal {
        Some(update) => (
            update.established_facts,
            update.identified_gaps,
            update.still_needed,
            update.summary,
            update.sources_used,
        ),
        None => (
            previous.established_facts.clone(),
            previous.identified_gaps.clone(),
            previous.still_needed.clone(),
            previous.summary.clone(),
            Vec::new(),
        ),
    };

    let mut sources_used = previous.sources_used.clone();
    for source in ledger.sources_used() {
        let key = url_key(&source.url);
        if !sources_used.iter().any(|known| url_key(&known.url) == key) {
            sources_used.push(source.clone());
        }
    }
    for annotation in annotations {
        let key = url_key(&annotation.url);
        if let Some(known) = sources_used
            .iter_mut()
            .find(|known| url_key(&known.url) == key)
        {
            if !annotation.contribution.trim().is_empty() {
                known.contribution = annotation.contribution;
            }
            if annotation.relevance > 0.0 {
                known.relevance = annotation.relevance;
            }
        }
    }

    CompressedContext {
        established_facts: facts,
        identified_gaps: gaps,
        sources_used,
        queries_tried: union(&previous.queries_tried, ledger.queries_tried()),
        web_searches_done: union(&previous.web_searches_done, ledger.web_searches_done()),
        summary,
        still_needed,
    }
}
