//! Running result set shared across loop iterations.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::retrieval::RetrievalHit;
use crate::web::WebResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Indexed,
    Web,
}

/// A source cited in the final output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub url: String,
    pub title: String,
}

/// Retrieved material handed to the refiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub kind: SourceKind,
    pub url: String,
    pub title: String,
    pub text: String,
    pub score: f32,
}

/// Indexed and web results gathered so far, de-duplicated by URL.
///
/// A URL contributes at most one entry for the whole run regardless of how
/// many queries return it or whether it arrives from the index or the web.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    indexed: Vec<RetrievalHit>,
    web: Vec<WebResult>,
    sources: Vec<SourceRef>,
    seen: HashSet<String>,
    initial_indexed: usize,
}

/// Identity used for URL de-duplication across the run.
pub(crate) fn url_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

impl ResultSet {
    /// Seed the set with the results the initial answer was synthesized from.
    pub fn from_initial(hits: Vec<RetrievalHit>) -> Self {
        let mut set = Self::default();
        set.merge_indexed(hits);
        set.initial_indexed = set.indexed.len();
        set
    }

    /// Merge indexed hits, returning the sources that were new.
    pub fn merge_indexed(&mut self, hits: Vec<RetrievalHit>) -> Vec<SourceRef> {
        let mut added = Vec::new();
        for hit in hits {
            if !self.seen.insert(url_key(&hit.url)) {
                continue;
            }
            let source = SourceRef {
                kind: SourceKind::Indexed,
                url: hit.url.clone(),
                title: hit.title.clone(),
            };
            self.sources.push(source.clone());
            self.indexed.push(hit);
            added.push(source);
        }
        added
    }

    /// Merge web results, returning the sources that were new.
    pub fn merge_web(&mut self, results: Vec<WebResult>) -> Vec<SourceRef> {
        let mut added = Vec::new();
        for result in results {
            if !self.seen.insert(url_key(&result.url)) {
                continue;
            }
            let source = SourceRef {
                kind: SourceKind::Web,
                url: result.url.clone(),
                title: result.title.clone(),
            };
            self.sources.push(source.clone());
            self.web.push(result);
            added.push(source);
        }
        added
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(&url_key(url))
    }

    pub fn indexed(&self) -> &[RetrievalHit] {
        &self.indexed
    }

    pub fn web(&self) -> &[WebResult] {
        &self.web
    }

    /// All sources in first-seen order.
    pub fn sources(&self) -> &[SourceRef] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Everything gathered after the initial synthesis.
    pub fn additional_material(&self) -> Vec<ContextSnippet> {
        let indexed = self.indexed[self.initial_indexed..]
            .iter()
            .map(|hit| ContextSnippet {
                kind: SourceKind::Indexed,
                url: hit.url.clone(),
                title: hit.title.clone(),
                text: hit.text.clone(),
                score: hit.score,
            });
        let web = self.web.iter().map(|result| ContextSnippet {
            kind: SourceKind::Web,
            url: result.url.clone(),
            title: result.title.clone(),
            text: result.content.clone(),
            score: result.score,
        });
        indexed.chain(web).collect()
    }
}
