#[cfg(feature = "qdrant-retriever")]
pub mod qdrant;
#[cfg(feature = "qdrant-retriever")]
pub use qdrant::{HybridRetriever, QdrantConfig};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

const MIN_KEYWORD_LEN: usize = 3;
const MAX_KEYWORDS: usize = 32;
const DEFAULT_PROJECT: &str = "default";

/// A ranked hit returned by the retrieval engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub url: String,
    pub title: String,
    pub text: String,
    pub score: f32,
}

/// Options accepted by [`RetrievalService::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: usize,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub rerank: bool,
    #[serde(default)]
    pub rerank_top_k: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 8,
            project: None,
            rerank: false,
            rerank_top_k: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestDocument {
    pub id: String,
    pub url: String,
    pub title: String,
    pub text: String,
}

/// Read-only document search used for the initial answer and for
/// additional document queries.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    async fn search(&self, query: &str, options: &SearchOptions)
    -> anyhow::Result<Vec<RetrievalHit>>;
}

pub type DynRetriever = Arc<dyn RetrievalService>;

/// Simple in-memory retriever for tests and offline runs.
///
/// Documents are grouped by project and scored by keyword overlap with the
/// query.
#[derive(Default)]
pub struct InMemoryRetriever {
    store: DashMap<String, Vec<IngestDocument>>,
}

impl InMemoryRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&self, project: Option<&str>, docs: Vec<IngestDocument>) {
        self.store
            .entry(project.unwrap_or(DEFAULT_PROJECT).to_string())
            .or_default()
            .extend(docs);
    }

    pub fn len(&self) -> usize {
        self.store.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RetrievalService for InMemoryRetriever {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        let project = options.project.as_deref().unwrap_or(DEFAULT_PROJECT);
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();

        let mut hits: Vec<RetrievalHit> = self
            .store
            .get(project)
            .map(|entry| {
                entry
                    .iter()
                    .filter_map(|doc| {
                        let keywords = tokenize(&format!("{} {}", doc.title, doc.text));
                        let score = lexical_overlap(&query_tokens, &keywords);
                        (score > 0.0).then(|| RetrievalHit {
                            url: doc.url.clone(),
                            title: doc.title.clone(),
                            text: doc.text.clone(),
                            score,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        rank_hits(&mut hits, options);
        Ok(hits)
    }
}

/// Sort by descending score and apply limit / rerank truncation.
pub(crate) fn rank_hits(hits: &mut Vec<RetrievalHit>, options: &SearchOptions) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep = options.limit;
    if options.rerank {
        if let Some(top_k) = options.rerank_top_k {
            keep = keep.min(top_k);
        }
    }
    hits.truncate(keep);
}

/// Lower-cased, de-duplicated keywords of at least three characters.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for token in text.split(|c: char| !c.is_alphanumeric()) {
        let token = token.trim().to_lowercase();
        if token.len() < MIN_KEYWORD_LEN {
            continue;
        }
        if seen.insert(token.clone()) {
            keywords.push(token);
        }
        if keywords.len() >= MAX_KEYWORDS {
            break;
        }
    }

    keywords
}

/// Share of query tokens present in the document keywords.
pub fn lexical_overlap(query_tokens: &HashSet<String>, doc_keywords: &[String]) -> f32 {
    if query_tokens.is_empty() || doc_keywords.is_empty() {
        return 0.0;
    }

    let overlap = doc_keywords
        .iter()
        .filter(|kw| query_tokens.contains(kw.as_str()))
        .count();

    overlap as f32 / query_tokens.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(url: &str, title: &str, text: &str) -> IngestDocument {
        IngestDocument {
            id: url.to_string(),
            url: url.to_string(),
            title: title.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn tokenize_deduplicates_keywords() {
        let tokens = tokenize("Rust enables resilient Rust retrieval, rust!");
        assert!(tokens.contains(&"rust".to_string()));
        assert_eq!(tokens.len(), tokens.iter().collect::<HashSet<_>>().len());
        assert!(tokens.iter().all(|token| token.len() >= MIN_KEYWORD_LEN));
    }

    #[test]
    fn lexical_overlap_returns_ratio() {
        let query = HashSet::from([String::from("rust"), String::from("tokio")]);
        assert_eq!(lexical_overlap(&query, &[String::from("rust")]), 0.5);
        assert_eq!(lexical_overlap(&query, &[String::from("python")]), 0.0);
    }

    #[tokio::test]
    async fn in_memory_search_ranks_and_scopes_by_project() {
        let retriever = InMemoryRetriever::new();
        retriever.ingest(
            None,
            vec![
                doc("docs://runtime", "Tokio runtime", "configure the tokio runtime builder"),
                doc("docs://sync", "Channels", "mpsc channels in tokio"),
                doc("docs://unrelated", "Cooking", "how to bake bread"),
            ],
        );
        retriever.ingest(Some("other"), vec![doc("docs://other", "Tokio", "tokio runtime")]);

        let hits = retriever
            .search("tokio runtime builder", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "docs://runtime");
        assert!(hits.iter().all(|hit| hit.url != "docs://other"));
    }

    #[test]
    fn rerank_truncates_to_top_k() {
        let mut hits: Vec<RetrievalHit> = (0..5)
            .map(|idx| RetrievalHit {
                url: format!("docs://{idx}"),
                title: String::new(),
                text: String::new(),
                score: idx as f32,
            })
            .collect();
        let options = SearchOptions {
            limit: 4,
            rerank: true,
            rerank_top_k: Some(2),
            ..SearchOptions::default()
        };
        rank_hits(&mut hits, &options);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "docs://4");
    }
}
