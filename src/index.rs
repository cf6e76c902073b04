//! Indexing stage: push unindexed messages into a vector index.
//!
//! The store flag is the source of truth for "already indexed". Messages are
//! flipped only after the index confirms the whole submission, so a failed
//! submission leaves every flag false and the next run retries the full set.
//!
//! Two backends implement [`VectorIndex`]:
//! - [`SqliteVectorIndex`]: vectors stored next to the message store, brute
//!   force cosine search.
//! - [`QdrantIndex`]: a Qdrant collection over REST. Reads `QDRANT_API_KEY`
//!   when set.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{Config, IndexConfig};
use crate::db;
use crate::embedding::{self, blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::error::{StageError, StageResult};
use crate::models::{ScoredMessage, VectorDocument, VectorMetadata};
use crate::store::MessageStore;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Submit documents. `Ok` means the index accepted every one of them.
    async fn upsert(&self, documents: &[VectorDocument]) -> StageResult<()>;

    async fn query(&self, text: &str, limit: usize) -> StageResult<Vec<ScoredMessage>>;
}

/// Index every unindexed message and return how many were flagged.
///
/// No call reaches the index when nothing is pending.
pub async fn index_pending(store: &MessageStore, index: &dyn VectorIndex) -> StageResult<u64> {
    let pending = store.unindexed().await?;
    if pending.is_empty() {
        info!(index = index.name(), "nothing to index");
        return Ok(0);
    }

    let documents: Vec<VectorDocument> = pending.iter().map(VectorDocument::from).collect();
    index.upsert(&documents).await?;

    let ids: Vec<String> = pending.into_iter().map(|m| m.id).collect();
    let updated = store.mark_indexed(&ids).await?;
    info!(index = index.name(), updated, "messages indexed");
    Ok(updated)
}

pub fn create_index(
    config: &IndexConfig,
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
) -> Result<Arc<dyn VectorIndex>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteVectorIndex::new(pool, embedder, batch_size))),
        "qdrant" => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("index.url required for qdrant backend"))?;
            Ok(Arc::new(QdrantIndex::new(
                &url,
                &config.collection,
                embedder,
                batch_size,
            )?))
        }
        other => bail!("Unknown index backend: {}", other),
    }
}

/// Index and embedder as configured.
pub fn index_from_config(config: &Config, pool: SqlitePool) -> Result<Arc<dyn VectorIndex>> {
    let embedder = embedding::create_embedder(&config.embedding)?;
    create_index(&config.index, pool, embedder, config.embedding.batch_size)
}

async fn embed_documents(
    embedder: &dyn Embedder,
    documents: &[VectorDocument],
    batch_size: usize,
) -> StageResult<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(documents.len());
    for batch in documents.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
        let embedded = embedder.embed(&texts).await?;
        if embedded.len() != batch.len() {
            return Err(StageError::Data(format!(
                "embedder returned {} vectors for {} texts",
                embedded.len(),
                batch.len()
            )));
        }
        vectors.extend(embedded);
    }
    Ok(vectors)
}

// ============ SQLite backend ============

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            pool,
            embedder,
            batch_size,
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, documents: &[VectorDocument]) -> StageResult<()> {
        let vectors = embed_documents(self.embedder.as_ref(), documents, self.batch_size).await?;

        let mut tx = self.pool.begin().await?;
        for (doc, vector) in documents.iter().zip(vectors.iter()) {
            sqlx::query(
                r#"
                INSERT INTO message_vectors
                    (message_id, channel_id, author_id, sent_at, text, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(message_id) DO UPDATE SET
                    channel_id = excluded.channel_id,
                    author_id = excluded.author_id,
                    sent_at = excluded.sent_at,
                    text = excluded.text,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&doc.metadata.message_id)
            .bind(&doc.metadata.channel_id)
            .bind(&doc.metadata.author_id)
            .bind(&doc.metadata.sent_at)
            .bind(&doc.text)
            .bind(self.embedder.model_name())
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, text: &str, limit: usize) -> StageResult<Vec<ScoredMessage>> {
        let query_vec = embedding::embed_query(self.embedder.as_ref(), text).await?;

        let rows = sqlx::query(
            "SELECT message_id, channel_id, author_id, sent_at, text, embedding FROM message_vectors",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredMessage> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let message_id: String = row.get("message_id");
                ScoredMessage {
                    score: cosine_similarity(&query_vec, &blob_to_vec(&blob)),
                    text: row.get("text"),
                    metadata: Some(VectorMetadata {
                        message_id: message_id.clone(),
                        channel_id: row.get("channel_id"),
                        author_id: row.get("author_id"),
                        sent_at: row.get("sent_at"),
                    }),
                    message_id,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }
}

// ============ Qdrant backend ============

pub struct QdrantIndex {
    client: reqwest::Client,
    url: String,
    collection: String,
    api_key: Option<String>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl QdrantIndex {
    pub fn new(
        url: &str,
        collection: &str,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            api_key: crate::mask::secret_env("QDRANT_API_KEY"),
            embedder,
            batch_size,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}/collections/{}{}", self.url, self.collection, path));
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    /// Create the collection if it does not exist yet.
    async fn ensure_collection(&self, dims: usize) -> StageResult<()> {
        let resp = self.request(reqwest::Method::GET, "").send().await?;
        if resp.status().is_success() {
            return Ok(());
        }

        let body = json!({ "vectors": { "size": dims, "distance": "Cosine" } });
        let resp = self
            .request(reqwest::Method::PUT, "")
            .json(&body)
            .send()
            .await?;
        check_status(resp, "create collection").await?;
        info!(collection = %self.collection, dims, "created qdrant collection");
        Ok(())
    }
}

/// Qdrant accepts unsigned integers or UUIDs as point ids.
pub fn point_id(message_id: &str) -> serde_json::Value {
    match message_id.parse::<u64>() {
        Ok(n) => json!(n),
        Err(_) => json!(uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, message_id.as_bytes())
            .to_string()),
    }
}

async fn check_status(resp: reqwest::Response, what: &str) -> StageResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = format!(
        "qdrant {} failed (HTTP {}): {}",
        what,
        status,
        body.chars().take(300).collect::<String>()
    );
    if status.as_u16() == 401 || status.as_u16() == 403 {
        Err(StageError::Permission(message))
    } else {
        Err(StageError::Transport(message))
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn upsert(&self, documents: &[VectorDocument]) -> StageResult<()> {
        let vectors = embed_documents(self.embedder.as_ref(), documents, self.batch_size).await?;
        let dims = vectors.first().map(Vec::len).unwrap_or(self.embedder.dims());
        self.ensure_collection(dims).await?;

        let points: Vec<serde_json::Value> = documents
            .iter()
            .zip(vectors)
            .map(|(doc, vector)| {
                json!({
                    "id": point_id(&doc.id),
                    "vector": vector,
                    "payload": {
                        "text": doc.text,
                        "messageId": doc.metadata.message_id,
                        "channelId": doc.metadata.channel_id,
                        "authorId": doc.metadata.author_id,
                        "sentAt": doc.metadata.sent_at,
                    }
                })
            })
            .collect();

        let resp = self
            .request(reqwest::Method::PUT, "/points?wait=true")
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check_status(resp, "upsert").await?;
        Ok(())
    }

    async fn query(&self, text: &str, limit: usize) -> StageResult<Vec<ScoredMessage>> {
        let vector = embedding::embed_query(self.embedder.as_ref(), text).await?;
        let resp = self
            .request(reqwest::Method::POST, "/points/search")
            .json(&json!({ "vector": vector, "limit": limit, "with_payload": true }))
            .send()
            .await?;
        let json: serde_json::Value = check_status(resp, "search").await?.json().await?;
        Ok(parse_search_hits(&json))
    }
}

fn parse_search_hits(json: &serde_json::Value) -> Vec<ScoredMessage> {
    let hits = json
        .get("result")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();

    hits.into_iter()
        .map(|hit| {
            let payload = hit.get("payload").cloned().unwrap_or_default();
            let metadata: Option<VectorMetadata> = serde_json::from_value(payload.clone()).ok();
            ScoredMessage {
                message_id: metadata
                    .as_ref()
                    .map(|m| m.message_id.clone())
                    .unwrap_or_else(|| hit["id"].to_string()),
                score: hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32,
                text: payload
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                metadata,
            }
        })
        .collect()
}

// ============ CLI ============

/// `arc index`: index everything pending in the store.
pub async fn run_index(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = MessageStore::new(pool.clone());
    let index = index_from_config(config, pool.clone())?;

    let before = store.stats().await?;
    let indexed = index_pending(&store, index.as_ref()).await?;

    println!("index ({})", index.name());
    println!("  pending before: {}", before.pending);
    println!("  indexed: {}", indexed);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// `arc search`: nearest messages to `query`.
pub async fn run_search(config: &Config, query: &str, limit: usize) -> Result<()> {
    let pool = db::connect(config).await?;
    let index = index_from_config(config, pool.clone())?;
    let results = index.query(query, limit).await?;

    if results.is_empty() {
        println!("No results.");
    }
    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.2}] {}", i + 1, result.score, result.message_id);
        if let Some(meta) = &result.metadata {
            println!("    channel: {}  author: {}", meta.channel_id, meta.author_id);
            println!("    sent: {}", meta.sent_at);
        }
        println!("    {}", result.text.replace('\n', " "));
        println!();
    }

    pool.close().await;
    Ok(())
}
