use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use fastembed::TextEmbedding;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, Filter, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{
    IngestDocument, RetrievalHit, RetrievalService, SearchOptions, lexical_overlap, rank_hits,
    tokenize,
};

const KEY_PROJECT: &str = "project";
const KEY_TEXT: &str = "text";
const KEY_URL: &str = "url";
const KEY_TITLE: &str = "title";
const KEY_KEYWORDS: &str = "keywords";
/// Dense candidates fetched per requested hit before the lexical boost re-sorts them.
const OVERFETCH: usize = 2;

#[derive(Clone, Debug)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    pub concurrency_limit: usize,
}

/// Dense FastEmbed search over Qdrant with a keyword-overlap boost.
pub struct HybridRetriever {
    client: Qdrant,
    collection: String,
    semaphore: Arc<Semaphore>,
    dense_model: Arc<Mutex<TextEmbedding>>,
}

impl HybridRetriever {
    pub async fn new(config: QdrantConfig) -> anyhow::Result<Self> {
        let (dense_model, dimension) = tokio::task::spawn_blocking(|| -> anyhow::Result<_> {
            let mut model = TextEmbedding::try_new(Default::default())
                .map_err(|err| anyhow!("failed to initialise FastEmbed model: {err}"))?;

            let warmup = model
                .embed(vec!["ragloop warmup"], Some(1))
                .map_err(|err| anyhow!("failed to warm up FastEmbed model: {err}"))?;
            let dimension = warmup
                .first()
                .map(|vector| vector.len())
                .filter(|len| *len > 0)
                .ok_or_else(|| anyhow!("FastEmbed warmup returned no embedding rows"))?;

            Ok((model, dimension))
        })
        .await??;

        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|err| anyhow!("failed to create Qdrant client: {err}"))?;

        ensure_collection(&client, &config.collection, dimension).await?;

        Ok(Self {
            client,
            collection: config.collection,
            semaphore: Arc::new(Semaphore::new(config.concurrency_limit.max(1))),
            dense_model: Arc::new(Mutex::new(dense_model)),
        })
    }

    /// Embed and upsert documents under `project`.
    pub async fn ingest(&self, project: &str, docs: Vec<IngestDocument>) -> anyhow::Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("semaphore closed unexpectedly")?;

        let texts: Vec<String> = docs.iter().map(|doc| doc.text.clone()).collect();
        let dense_model = self.dense_model.clone();

        let embeddings = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Vec<f32>>> {
            let mut model = dense_model
                .lock()
                .map_err(|_| anyhow!("embedding model poisoned"))?;
            model
                .embed(texts, Some(32))
                .map_err(|err| anyhow!("failed to embed documents: {err}"))
        })
        .await??;

        let mut points = Vec::with_capacity(docs.len());
        for (doc, vector) in docs.iter().zip(embeddings.into_iter()) {
            let payload = build_payload(project, doc)?;
            points.push(PointStruct::new(doc.id.clone(), vector, payload));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|err| anyhow!("failed to upsert documents into qdrant: {err}"))?;

        debug!(project, count = docs.len(), "ingested documents into qdrant");
        Ok(())
    }
}

async fn ensure_collection(
    client: &Qdrant,
    collection: &str,
    dimension: usize,
) -> anyhow::Result<()> {
    if client.collection_exists(collection).await? {
        return Ok(());
    }

    client
        .create_collection(
            CreateCollectionBuilder::new(collection)
                .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
        )
        .await
        .map_err(|err| anyhow!("failed to create qdrant collection '{collection}': {err}"))?;
    info!(collection, dimension, "created qdrant collection");
    Ok(())
}

fn payload_string(map: &mut HashMap<String, Value>, key: &str) -> String {
    map.remove(key)
        .and_then(|value| value.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

fn hit_from_payload(
    payload: qdrant_client::Payload,
    score: f32,
    query_tokens: &HashSet<String>,
) -> RetrievalHit {
    let mut map: HashMap<String, Value> = payload.into();
    let keywords: Vec<String> = map
        .remove(KEY_KEYWORDS)
        .and_then(|value| value.as_array().cloned())
        .map(|values| {
            values
                .into_iter()
                .filter_map(|value| value.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    RetrievalHit {
        url: payload_string(&mut map, KEY_URL),
        title: payload_string(&mut map, KEY_TITLE),
        text: payload_string(&mut map, KEY_TEXT),
        score: score + lexical_overlap(query_tokens, &keywords),
    }
}

fn build_payload(project: &str, doc: &IngestDocument) -> anyhow::Result<qdrant_client::Payload> {
    let payload = serde_json::json!({
        KEY_PROJECT: project,
        KEY_TEXT: doc.text,
        KEY_URL: doc.url,
        KEY_TITLE: doc.title,
        KEY_KEYWORDS: tokenize(&format!("{} {}", doc.title, doc.text)),
    });

    payload
        .try_into()
        .map_err(|err| anyhow!("failed to convert payload: {err}"))
}

#[async_trait]
impl RetrievalService for HybridRetriever {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> anyhow::Result<Vec<RetrievalHit>> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("semaphore closed unexpectedly")?;

        let dense_model = self.dense_model.clone();
        let owned_query = query.to_string();
        let query_embedding = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<f32>> {
            let mut model = dense_model
                .lock()
                .map_err(|_| anyhow!("embedding model poisoned"))?;
            let embeddings = model
                .embed(vec![owned_query], Some(1))
                .map_err(|err| anyhow!("failed to embed query: {err}"))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("embedding model returned empty result"))
        })
        .await??;

        let fetch = (options.limit.max(1) * OVERFETCH) as u64;
        let mut request =
            SearchPointsBuilder::new(&self.collection, query_embedding, fetch).with_payload(true);
        if let Some(project) = &options.project {
            request = request.filter(Filter::all([Condition::matches(
                KEY_PROJECT,
                project.clone(),
            )]));
        }

        let search = self
            .client
            .search_points(request)
            .await
            .map_err(|err| anyhow!("qdrant search failed: {err}"))?;

        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        let mut hits: Vec<RetrievalHit> = search
            .result
            .into_iter()
            .map(|point| hit_from_payload(point.payload.into(), point.score, &query_tokens))
            .filter(|hit| !hit.url.is_empty())
            .collect();

        rank_hits(&mut hits, options);
        debug!(query, hits = hits.len(), "qdrant search complete");
        Ok(hits)
    }
}
