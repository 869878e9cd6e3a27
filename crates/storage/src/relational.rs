//! Relational store backed by Postgres with the `vector` extension.
//!
//! Schema: a `documents` table with a typed vector column (dimension
//! baked into the column type), a weighted text-search column (`A` from
//! the file name, `B` from the optional summary, `C` from the body), and
//! JSONB metadata for exact-match filters. A single-row
//! `embedding_metadata` table binds the store to one embedding model.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use deadpool_postgres::{Config as DeadpoolConfig, Pool, PoolConfig, Runtime};
use pgvector::Vector;
use tokio::sync::OnceCell;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use recall_core::config::{BackendKind, DistanceMetric, RelationalConfig};
use recall_core::types::{ChunkMetadata, EmbeddingMetadata, SearchResult};

use crate::{Result, StorageBackend, StorageError, UpsertBatch, normalize_batch, normalize_by_max, normalize_distance};

/// Connection attempts during initialize, doubling from one second.
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

pub struct RelationalStore {
  config: RelationalConfig,
  url: String,
  dimension: usize,
  distance: DistanceMetric,
  pool: OnceCell<Pool>,
  initialized: AtomicBool,
}

impl RelationalStore {
  pub fn new(config: &RelationalConfig, dimension: usize, distance: DistanceMetric) -> Self {
    Self {
      config: config.clone(),
      url: config.connection_url(),
      dimension,
      distance,
      pool: OnceCell::new(),
      initialized: AtomicBool::new(false),
    }
  }

  fn pool(&self) -> Result<&Pool> {
    self.pool.get().ok_or(StorageError::NotInitialized)
  }

  async fn client(&self) -> Result<deadpool_postgres::Object> {
    self
      .pool()?
      .get()
      .await
      .map_err(|e| StorageError::Connection(e.to_string()))
  }

  fn language(&self) -> &'static str {
    self.config.language.as_str()
  }

  /// pgvector distance operator for the configured metric.
  fn distance_operator(&self) -> &'static str {
    match self.distance {
      DistanceMetric::Cosine => "<=>",
      DistanceMetric::L2 => "<->",
      DistanceMetric::InnerProduct => "<#>",
    }
  }

  fn index_opclass(&self) -> &'static str {
    match self.distance {
      DistanceMetric::Cosine => "vector_cosine_ops",
      DistanceMetric::L2 => "vector_l2_ops",
      DistanceMetric::InnerProduct => "vector_ip_ops",
    }
  }

  async fn bootstrap_schema(&self, client: &deadpool_postgres::Object) -> Result<()> {
    debug!("Bootstrapping relational schema");

    client.batch_execute("CREATE EXTENSION IF NOT EXISTS vector").await.map_err(|e| {
      StorageError::ExtensionMissing(format!(
        "the 'vector' extension could not be enabled ({}); install pgvector on the server and grant CREATE EXTENSION",
        e
      ))
    })?;

    let create_documents = format!(
      "CREATE TABLE IF NOT EXISTS documents (
         chunk_id   TEXT PRIMARY KEY,
         text       TEXT NOT NULL,
         metadata   JSONB NOT NULL DEFAULT '{{}}'::jsonb,
         embedding  vector({dim}) NOT NULL,
         tsv        tsvector NOT NULL,
         created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
         updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
       )",
      dim = self.dimension
    );

    let create_ann_index = format!(
      "CREATE INDEX IF NOT EXISTS documents_embedding_idx
         ON documents USING hnsw (embedding {opclass})
         WITH (m = {m}, ef_construction = {ef})",
      opclass = self.index_opclass(),
      m = self.config.hnsw_m,
      ef = self.config.hnsw_ef_construction
    );

    let statements = [
      create_documents.as_str(),
      create_ann_index.as_str(),
      "CREATE INDEX IF NOT EXISTS documents_tsv_idx ON documents USING gin (tsv)",
      "CREATE INDEX IF NOT EXISTS documents_metadata_idx ON documents USING gin (metadata)",
      "CREATE TABLE IF NOT EXISTS embedding_metadata (
         id        INT PRIMARY KEY CHECK (id = 1),
         provider  TEXT NOT NULL,
         model     TEXT NOT NULL,
         dimension INT NOT NULL
       )",
    ];

    for statement in statements {
      client
        .batch_execute(statement)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    }

    Ok(())
  }

  fn upsert_sql(&self) -> String {
    format!(
      "INSERT INTO documents (chunk_id, text, metadata, embedding, tsv, updated_at)
       VALUES ($1, $2, $3, $4,
         setweight(to_tsvector('{lang}', coalesce($5, '')), 'A') ||
         setweight(to_tsvector('{lang}', coalesce($6, '')), 'B') ||
         setweight(to_tsvector('{lang}', $2), 'C'),
         now())
       ON CONFLICT (chunk_id) DO UPDATE SET
         text = EXCLUDED.text,
         metadata = EXCLUDED.metadata,
         embedding = EXCLUDED.embedding,
         tsv = EXCLUDED.tsv,
         updated_at = now()",
      lang = self.language()
    )
  }
}

#[async_trait::async_trait]
impl StorageBackend for RelationalStore {
  fn kind(&self) -> BackendKind {
    BackendKind::Relational
  }

  async fn initialize(&self) -> Result<()> {
    self
      .pool
      .get_or_try_init(|| async {
        let mut cfg = DeadpoolConfig::new();
        cfg.url = Some(self.url.clone());
        cfg.pool = Some(PoolConfig::new(self.config.max_pool_size()));
        cfg
          .create_pool(Some(Runtime::Tokio1), NoTls)
          .map_err(|e| StorageError::Connection(e.to_string()))
      })
      .await?;

    // Connect with retry for recoverable transport failures.
    let mut backoff = CONNECT_INITIAL_BACKOFF;
    let mut last_error = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
      match self.client().await {
        Ok(client) => {
          self.bootstrap_schema(&client).await?;
          self.initialized.store(true, Ordering::SeqCst);
          info!(
            host = %self.config.host,
            database = %self.config.database,
            dimension = self.dimension,
            "Relational store initialized"
          );
          return Ok(());
        }
        Err(e) => {
          warn!(attempt, max_attempts = CONNECT_ATTEMPTS, err = %e, "Connection attempt failed");
          last_error = Some(e);
          if attempt < CONNECT_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
          }
        }
      }
    }

    Err(last_error.unwrap_or_else(|| StorageError::Connection("connection attempts exhausted".into())))
  }

  fn is_initialized(&self) -> bool {
    self.initialized.load(Ordering::SeqCst)
  }

  async fn upsert_documents(&self, batch: UpsertBatch) -> Result<usize> {
    if batch.is_empty() {
      return Ok(0);
    }
    batch.validate(self.dimension)?;

    let mut client = self.client().await?;
    let tx = client
      .transaction()
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;
    let stmt = tx
      .prepare(&self.upsert_sql())
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;

    for index in 0..batch.len() {
      let metadata = &batch.metadatas[index];
      let metadata_json = serde_json::to_value(metadata.to_map())?;
      let embedding = Vector::from(batch.embeddings[index].clone());
      tx.execute(
        &stmt,
        &[
          &batch.ids[index],
          &batch.documents[index],
          &metadata_json,
          &embedding,
          &metadata.file_name,
          &metadata.summary,
        ],
      )
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;
    }

    tx.commit().await.map_err(|e| StorageError::Backend(e.to_string()))?;
    debug!(batch_size = batch.len(), "Upserted documents");
    Ok(batch.len())
  }

  async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
    // Empty ids must never translate into "delete all".
    if ids.is_empty() {
      return Ok(0);
    }

    let client = self.client().await?;
    let deleted = client
      .execute("DELETE FROM documents WHERE chunk_id = ANY($1)", &[&ids.to_vec()])
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;

    debug!(requested = ids.len(), deleted, "Deleted chunks by id");
    Ok(deleted as usize)
  }

  async fn delete_by_metadata(&self, filter: &BTreeMap<String, String>) -> Result<usize> {
    if filter.is_empty() {
      // An empty containment filter matches every row; guard it.
      return Ok(0);
    }

    let filter_json = serde_json::to_value(filter)?;
    let client = self.client().await?;
    let deleted = client
      .execute("DELETE FROM documents WHERE metadata @> $1", &[&filter_json])
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;

    Ok(deleted as usize)
  }

  async fn vector_search(
    &self,
    query_embedding: &[f32],
    top_k: usize,
    similarity_threshold: f32,
  ) -> Result<Vec<SearchResult>> {
    if query_embedding.len() != self.dimension {
      return Err(StorageError::InvalidInput(format!(
        "query embedding has dimension {}, store is bound to {}",
        query_embedding.len(),
        self.dimension
      )));
    }

    let sql = format!(
      "SELECT chunk_id, text, metadata, (embedding {op} $1) AS distance
       FROM documents
       ORDER BY embedding {op} $1
       LIMIT $2",
      op = self.distance_operator()
    );

    let embedding = Vector::from(query_embedding.to_vec());
    let client = self.client().await?;
    let rows = client
      .query(&sql, &[&embedding, &(top_k as i64)])
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;

    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
      let distance: f64 = row.get("distance");
      let mut result = row_to_result(&row)?;
      result.score = normalize_distance(self.distance, distance as f32);
      results.push(result);
    }

    normalize_batch(self.distance, &mut results);
    results.retain(|r| r.score >= similarity_threshold);
    Ok(results)
  }

  async fn keyword_search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
    let sql = format!(
      "SELECT chunk_id, text, metadata, ts_rank_cd(tsv, query) AS rank
       FROM documents, websearch_to_tsquery('{lang}', $1) AS query
       WHERE tsv @@ query
       ORDER BY rank DESC, chunk_id
       LIMIT $2",
      lang = self.language()
    );

    let client = self.client().await?;
    let rows = client
      .query(&sql, &[&query, &(top_k as i64)])
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;

    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
      let rank: f32 = row.get("rank");
      let mut result = row_to_result(&row)?;
      result.score = rank;
      results.push(result);
    }

    normalize_by_max(&mut results);
    Ok(results)
  }

  async fn get_count(&self) -> Result<usize> {
    let client = self.client().await?;
    let row = client
      .query_one("SELECT count(*) FROM documents", &[])
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;
    let count: i64 = row.get(0);
    Ok(count as usize)
  }

  async fn reset(&self) -> Result<()> {
    info!(database = %self.config.database, "Resetting relational store");
    let client = self.client().await?;
    client
      .batch_execute("TRUNCATE documents; DELETE FROM embedding_metadata")
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(())
  }

  async fn get_embedding_metadata(&self) -> Result<Option<EmbeddingMetadata>> {
    let client = self.client().await?;
    let rows = client
      .query("SELECT provider, model, dimension FROM embedding_metadata WHERE id = 1", &[])
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;

    Ok(rows.first().map(|row| {
      let dimension: i32 = row.get("dimension");
      EmbeddingMetadata {
        provider: row.get("provider"),
        model: row.get("model"),
        dimension: dimension as usize,
      }
    }))
  }

  async fn set_embedding_metadata(&self, metadata: &EmbeddingMetadata) -> Result<()> {
    if let Some(existing) = self.get_embedding_metadata().await? {
      if existing == *metadata {
        return Ok(());
      }
      if existing.dimension != metadata.dimension && self.get_count().await? > 0 {
        return Err(StorageError::DimensionMismatch {
          stored: existing.dimension,
          configured: metadata.dimension,
        });
      }
    }

    let client = self.client().await?;
    client
      .execute(
        "INSERT INTO embedding_metadata (id, provider, model, dimension)
         VALUES (1, $1, $2, $3)
         ON CONFLICT (id) DO UPDATE SET
           provider = EXCLUDED.provider,
           model = EXCLUDED.model,
           dimension = EXCLUDED.dimension",
        &[&metadata.provider, &metadata.model, &(metadata.dimension as i32)],
      )
      .await
      .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    if let Some(pool) = self.pool.get() {
      pool.close();
    }
    self.initialized.store(false, Ordering::SeqCst);
    Ok(())
  }
}

fn row_to_result(row: &tokio_postgres::Row) -> Result<SearchResult> {
  let metadata_json: serde_json::Value = row.get("metadata");
  let map: BTreeMap<String, String> = serde_json::from_value(metadata_json)?;

  Ok(SearchResult {
    chunk_id: row.get("chunk_id"),
    text: row.get("text"),
    metadata: ChunkMetadata::from_map(map),
    score: 0.0,
    rerank_score: None,
    original_rank: None,
  })
}
