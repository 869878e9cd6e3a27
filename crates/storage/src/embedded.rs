//! Embedded vector store backed by LanceDB.
//!
//! A single on-disk `chunks` collection holds text, flat metadata
//! attributes, and the embedding vector; an auxiliary full-text index
//! over the `lexical` column provides BM25-style keyword search. The
//! vector dimension is fixed at open and recorded in the single-row
//! `embedding_metadata` table.
//!
//! Concurrency: at most one writer. Reads may proceed concurrently with
//! writes; callers must not rely on cross-operation atomicity.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow_array::{Array, FixedSizeListArray, Float32Array, Int32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lance_index::scalar::FullTextSearchQuery;
use lancedb::index::Index;
use lancedb::index::scalar::FtsIndexBuilder;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table, connect};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use recall_core::config::{BackendKind, DistanceMetric};
use recall_core::types::{ChunkMetadata, EmbeddingMetadata, SearchResult};

use crate::{Result, StorageBackend, StorageError, UpsertBatch, normalize_batch, normalize_by_max, normalize_distance};

const CHUNKS_TABLE: &str = "chunks";
const METADATA_TABLE: &str = "embedding_metadata";
/// Column carrying the concatenated lexical text (file name, summary,
/// body) that the full-text index is built over.
const LEXICAL_COLUMN: &str = "lexical";

pub struct EmbeddedStore {
  path: PathBuf,
  dimension: usize,
  distance: DistanceMetric,
  connection: OnceCell<Connection>,
  initialized: AtomicBool,
}

impl EmbeddedStore {
  pub fn new(path: PathBuf, dimension: usize, distance: DistanceMetric) -> Self {
    Self {
      path,
      dimension,
      distance,
      connection: OnceCell::new(),
      initialized: AtomicBool::new(false),
    }
  }

  fn distance_type(&self) -> DistanceType {
    match self.distance {
      DistanceMetric::Cosine => DistanceType::Cosine,
      DistanceMetric::L2 => DistanceType::L2,
      DistanceMetric::InnerProduct => DistanceType::Dot,
    }
  }

  fn connection(&self) -> Result<&Connection> {
    self.connection.get().ok_or(StorageError::NotInitialized)
  }

  async fn chunks_table(&self) -> Result<Table> {
    Ok(
      self
        .connection()?
        .open_table(CHUNKS_TABLE)
        .execute()
        .await
        .map_err(backend_err)?,
    )
  }

  async fn metadata_table(&self) -> Result<Table> {
    Ok(
      self
        .connection()?
        .open_table(METADATA_TABLE)
        .execute()
        .await
        .map_err(backend_err)?,
    )
  }

  fn chunks_schema(&self) -> std::sync::Arc<Schema> {
    std::sync::Arc::new(Schema::new(vec![
      Field::new("chunk_id", DataType::Utf8, false),
      Field::new("text", DataType::Utf8, false),
      Field::new("summary", DataType::Utf8, true),
      Field::new("source", DataType::Utf8, false),
      Field::new("file_name", DataType::Utf8, false),
      Field::new("source_type", DataType::Utf8, false),
      Field::new("language", DataType::Utf8, true),
      Field::new("extra", DataType::Utf8, false), // JSON object
      Field::new(LEXICAL_COLUMN, DataType::Utf8, false),
      Field::new("created_at", DataType::Int64, false),
      Field::new(
        "vector",
        DataType::FixedSizeList(
          std::sync::Arc::new(Field::new("item", DataType::Float32, true)),
          self.dimension as i32,
        ),
        false,
      ),
    ]))
  }

  fn metadata_schema(&self) -> std::sync::Arc<Schema> {
    std::sync::Arc::new(Schema::new(vec![
      Field::new("id", DataType::Int32, false),
      Field::new("provider", DataType::Utf8, false),
      Field::new("model", DataType::Utf8, false),
      Field::new("dimension", DataType::Int32, false),
    ]))
  }

  async fn ensure_tables(&self, connection: &Connection) -> Result<()> {
    let names = connection.table_names().execute().await.map_err(backend_err)?;
    debug!(existing_tables = names.len(), "Checking required tables");

    if !names.contains(&CHUNKS_TABLE.to_string()) {
      debug!("Creating chunks table");
      connection
        .create_empty_table(CHUNKS_TABLE, self.chunks_schema())
        .execute()
        .await
        .map_err(backend_err)?;
    }

    if !names.contains(&METADATA_TABLE.to_string()) {
      debug!("Creating embedding_metadata table");
      connection
        .create_empty_table(METADATA_TABLE, self.metadata_schema())
        .execute()
        .await
        .map_err(backend_err)?;
    }

    Ok(())
  }

  /// (Re)build the full-text index over the lexical column. Called after
  /// writes; a replace keeps the index in sync with new rows.
  async fn refresh_fts_index(&self, table: &Table) -> Result<()> {
    table
      .create_index(&[LEXICAL_COLUMN], Index::FTS(FtsIndexBuilder::default()))
      .replace(true)
      .execute()
      .await
      .map_err(backend_err)
  }

  fn batch_to_record(&self, batch: &UpsertBatch) -> Result<RecordBatch> {
    let now = chrono::Utc::now().timestamp_millis();

    let ids = StringArray::from(batch.ids.clone());
    let texts = StringArray::from(batch.documents.clone());
    let summaries = StringArray::from(
      batch
        .metadatas
        .iter()
        .map(|m| m.summary.clone())
        .collect::<Vec<Option<String>>>(),
    );
    let sources = StringArray::from(batch.metadatas.iter().map(|m| m.source.clone()).collect::<Vec<_>>());
    let file_names = StringArray::from(batch.metadatas.iter().map(|m| m.file_name.clone()).collect::<Vec<_>>());
    let source_types = StringArray::from(
      batch
        .metadatas
        .iter()
        .map(|m| m.source_type.as_str().to_string())
        .collect::<Vec<_>>(),
    );
    let languages = StringArray::from(
      batch
        .metadatas
        .iter()
        .map(|m| m.language.clone())
        .collect::<Vec<Option<String>>>(),
    );
    let extras = batch
      .metadatas
      .iter()
      .map(|m| serde_json::to_string(&m.extra).map_err(StorageError::from))
      .collect::<Result<Vec<_>>>()?;
    let extras = StringArray::from(extras);
    let lexical = StringArray::from(
      batch
        .metadatas
        .iter()
        .zip(&batch.documents)
        .map(|(m, text)| match m.summary.as_deref() {
          Some(summary) => format!("{}\n{}\n{}", m.file_name, summary, text),
          None => format!("{}\n{}", m.file_name, text),
        })
        .collect::<Vec<_>>(),
    );
    let created_at = Int64Array::from(vec![now; batch.len()]);

    let flattened: Vec<f32> = batch.embeddings.iter().flatten().copied().collect();
    let field = std::sync::Arc::new(Field::new("item", DataType::Float32, true));
    let vectors = FixedSizeListArray::try_new(
      field,
      self.dimension as i32,
      std::sync::Arc::new(Float32Array::from(flattened)),
      None,
    )?;

    let record = RecordBatch::try_new(
      self.chunks_schema(),
      vec![
        std::sync::Arc::new(ids),
        std::sync::Arc::new(texts),
        std::sync::Arc::new(summaries),
        std::sync::Arc::new(sources),
        std::sync::Arc::new(file_names),
        std::sync::Arc::new(source_types),
        std::sync::Arc::new(languages),
        std::sync::Arc::new(extras),
        std::sync::Arc::new(lexical),
        std::sync::Arc::new(created_at),
        std::sync::Arc::new(vectors),
      ],
    )?;

    Ok(record)
  }

  /// Compile the known metadata fields of a filter into a SQL predicate.
  /// Returns the predicate and the remaining (extra) keys.
  fn known_field_predicate(filter: &BTreeMap<String, String>) -> (Option<String>, BTreeMap<String, String>) {
    const KNOWN: &[&str] = &["source", "file_name", "source_type", "language"];

    let mut clauses = Vec::new();
    let mut extra = BTreeMap::new();
    for (key, value) in filter {
      if KNOWN.contains(&key.as_str()) {
        clauses.push(format!("{} = '{}'", key, escape(value)));
      } else {
        extra.insert(key.clone(), value.clone());
      }
    }

    let predicate = if clauses.is_empty() {
      None
    } else {
      Some(clauses.join(" AND "))
    };
    (predicate, extra)
  }

  async fn collect_results(
    &self,
    batches: Vec<RecordBatch>,
    score_column: &str,
  ) -> Result<Vec<(SearchResult, f32)>> {
    let mut results = Vec::new();
    for batch in batches {
      for row in 0..batch.num_rows() {
        let result = row_to_result(&batch, row)?;
        let raw = batch
          .column_by_name(score_column)
          .and_then(|col| col.as_any().downcast_ref::<Float32Array>())
          .map(|arr| arr.value(row))
          .unwrap_or(0.0);
        results.push((result, raw));
      }
    }
    Ok(results)
  }
}

#[async_trait::async_trait]
impl StorageBackend for EmbeddedStore {
  fn kind(&self) -> BackendKind {
    BackendKind::Embedded
  }

  async fn initialize(&self) -> Result<()> {
    let connection = self
      .connection
      .get_or_try_init(|| async {
        if let Some(parent) = self.path.parent() {
          tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        }

        info!(path = %self.path.display(), dimension = self.dimension, "Opening embedded store");
        connect(self.path.to_string_lossy().as_ref())
          .execute()
          .await
          .map_err(|e| StorageError::Connection(e.to_string()))
      })
      .await?;

    self.ensure_tables(connection).await?;
    self.initialized.store(true, Ordering::SeqCst);
    Ok(())
  }

  fn is_initialized(&self) -> bool {
    self.initialized.load(Ordering::SeqCst)
  }

  async fn upsert_documents(&self, batch: UpsertBatch) -> Result<usize> {
    if batch.is_empty() {
      return Ok(0);
    }
    batch.validate(self.dimension)?;

    let count = batch.len();
    debug!(table = CHUNKS_TABLE, batch_size = count, "Upserting documents");

    let table = self.chunks_table().await?;
    let record = self.batch_to_record(&batch)?;
    let schema = self.chunks_schema();
    let reader = RecordBatchIterator::new(vec![Ok(record)].into_iter(), schema);

    let mut merge = table.merge_insert(&["chunk_id"]);
    merge.when_matched_update_all(None).when_not_matched_insert_all();
    merge.execute(Box::new(reader)).await.map_err(backend_err)?;

    self.refresh_fts_index(&table).await?;
    Ok(count)
  }

  async fn delete_by_ids(&self, ids: &[String]) -> Result<usize> {
    // Empty ids must never translate into "delete all".
    if ids.is_empty() {
      return Ok(0);
    }

    let table = self.chunks_table().await?;
    let quoted: Vec<String> = ids.iter().map(|id| format!("'{}'", escape(id))).collect();
    let predicate = format!("chunk_id IN ({})", quoted.join(", "));

    let matched = table.count_rows(Some(predicate.clone())).await.map_err(backend_err)?;
    if matched == 0 {
      return Ok(0);
    }

    debug!(table = CHUNKS_TABLE, ids = ids.len(), matched, "Deleting chunks by id");
    table.delete(&predicate).await.map_err(backend_err)?;
    Ok(matched)
  }

  async fn delete_by_metadata(&self, filter: &BTreeMap<String, String>) -> Result<usize> {
    if filter.is_empty() {
      return Ok(0);
    }

    let (predicate, extra) = Self::known_field_predicate(filter);
    let table = self.chunks_table().await?;

    if extra.is_empty() {
      let predicate = predicate.ok_or_else(|| StorageError::InvalidInput("empty metadata filter".into()))?;
      let matched = table.count_rows(Some(predicate.clone())).await.map_err(backend_err)?;
      if matched == 0 {
        return Ok(0);
      }
      table.delete(&predicate).await.map_err(backend_err)?;
      return Ok(matched);
    }

    // Extra keys lack native matching: enumerate candidate ids first,
    // then reuse the id-based path with its empty-list guard.
    let query = match predicate {
      Some(ref p) => table.query().only_if(p.clone()),
      None => table.query(),
    };
    let batches: Vec<RecordBatch> = query
      .execute()
      .await
      .map_err(backend_err)?
      .try_collect()
      .await
      .map_err(backend_err)?;

    let mut matching_ids = Vec::new();
    for batch in batches {
      for row in 0..batch.num_rows() {
        let result = row_to_result(&batch, row)?;
        if extra
          .iter()
          .all(|(key, value)| result.metadata.extra.get(key) == Some(value))
        {
          matching_ids.push(result.chunk_id);
        }
      }
    }

    self.delete_by_ids(&matching_ids).await
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

    let table = self.chunks_table().await?;
    let batches: Vec<RecordBatch> = table
      .vector_search(query_embedding.to_vec())
      .map_err(backend_err)?
      .distance_type(self.distance_type())
      .limit(top_k)
      .execute()
      .await
      .map_err(backend_err)?
      .try_collect()
      .await
      .map_err(backend_err)?;

    let raw = self.collect_results(batches, "_distance").await?;
    let mut results: Vec<SearchResult> = raw
      .into_iter()
      .map(|(mut result, distance)| {
        result.score = normalize_distance(self.distance, distance);
        result
      })
      .collect();

    normalize_batch(self.distance, &mut results);
    results.retain(|r| r.score >= similarity_threshold);
    Ok(results)
  }

  async fn keyword_search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
    let table = self.chunks_table().await?;
    if table.count_rows(None).await.map_err(backend_err)? == 0 {
      return Ok(Vec::new());
    }

    let batches: Vec<RecordBatch> = table
      .query()
      .full_text_search(FullTextSearchQuery::new(query.to_string()))
      .limit(top_k)
      .execute()
      .await
      .map_err(backend_err)?
      .try_collect()
      .await
      .map_err(backend_err)?;

    let raw = self.collect_results(batches, "_score").await?;
    let mut results: Vec<SearchResult> = raw
      .into_iter()
      .map(|(mut result, score)| {
        result.score = score;
        result
      })
      .collect();

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(top_k);
    normalize_by_max(&mut results);
    Ok(results)
  }

  async fn get_count(&self) -> Result<usize> {
    let table = self.chunks_table().await?;
    table.count_rows(None).await.map_err(backend_err)
  }

  async fn reset(&self) -> Result<()> {
    let connection = self.connection()?;
    info!(path = %self.path.display(), "Resetting embedded store");

    for name in [CHUNKS_TABLE, METADATA_TABLE] {
      if let Err(e) = connection.drop_table(name, &[]).await {
        debug!(table = name, err = %e, "Drop during reset (table may not exist)");
      }
    }
    self.ensure_tables(connection).await
  }

  async fn get_embedding_metadata(&self) -> Result<Option<EmbeddingMetadata>> {
    let table = self.metadata_table().await?;
    let batches: Vec<RecordBatch> = table
      .query()
      .limit(1)
      .execute()
      .await
      .map_err(backend_err)?
      .try_collect()
      .await
      .map_err(backend_err)?;

    for batch in batches {
      if batch.num_rows() == 0 {
        continue;
      }
      let provider = string_value(&batch, "provider", 0)?;
      let model = string_value(&batch, "model", 0)?;
      let dimension = batch
        .column_by_name("dimension")
        .and_then(|col| col.as_any().downcast_ref::<Int32Array>())
        .map(|arr| arr.value(0) as usize)
        .ok_or_else(|| StorageError::Backend("missing dimension column".into()))?;
      return Ok(Some(EmbeddingMetadata {
        provider,
        model,
        dimension,
      }));
    }
    Ok(None)
  }

  async fn set_embedding_metadata(&self, metadata: &EmbeddingMetadata) -> Result<()> {
    match self.get_embedding_metadata().await? {
      Some(existing) if existing == *metadata => return Ok(()),
      Some(existing) if existing.dimension != metadata.dimension => {
        if self.get_count().await? > 0 {
          return Err(StorageError::DimensionMismatch {
            stored: existing.dimension,
            configured: metadata.dimension,
          });
        }
        let table = self.metadata_table().await?;
        table.delete("id = 1").await.map_err(backend_err)?;
      }
      Some(_) => {
        // Same dimension, different provider/model label: replace the row.
        let table = self.metadata_table().await?;
        table.delete("id = 1").await.map_err(backend_err)?;
      }
      None => {}
    }

    let table = self.metadata_table().await?;
    let record = RecordBatch::try_new(
      self.metadata_schema(),
      vec![
        std::sync::Arc::new(Int32Array::from(vec![1])),
        std::sync::Arc::new(StringArray::from(vec![metadata.provider.clone()])),
        std::sync::Arc::new(StringArray::from(vec![metadata.model.clone()])),
        std::sync::Arc::new(Int32Array::from(vec![metadata.dimension as i32])),
      ],
    )?;

    let reader = RecordBatchIterator::new(vec![Ok(record)].into_iter(), self.metadata_schema());
    table.add(Box::new(reader)).execute().await.map_err(backend_err)?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    // File-backed; nothing to release.
    Ok(())
  }
}

fn backend_err<E: std::fmt::Display>(e: E) -> StorageError {
  StorageError::Backend(e.to_string())
}

fn escape(value: &str) -> String {
  value.replace('\'', "''")
}

fn string_value(batch: &RecordBatch, name: &str, row: usize) -> Result<String> {
  batch
    .column_by_name(name)
    .and_then(|col| col.as_any().downcast_ref::<StringArray>())
    .map(|arr| arr.value(row).to_string())
    .ok_or_else(|| StorageError::Backend(format!("missing column {}", name)))
}

fn optional_string_value(batch: &RecordBatch, name: &str, row: usize) -> Option<String> {
  batch
    .column_by_name(name)
    .and_then(|col| col.as_any().downcast_ref::<StringArray>())
    .and_then(|arr| if arr.is_null(row) { None } else { Some(arr.value(row).to_string()) })
}

fn row_to_result(batch: &RecordBatch, row: usize) -> Result<SearchResult> {
  let extra: BTreeMap<String, String> = match optional_string_value(batch, "extra", row) {
    Some(json) if !json.is_empty() => serde_json::from_str(&json)?,
    _ => BTreeMap::new(),
  };

  let mut metadata = ChunkMetadata::new(
    string_value(batch, "source", row)?,
    string_value(batch, "file_name", row)?,
    string_value(batch, "source_type", row)?
      .parse()
      .map_err(StorageError::Backend)?,
  );
  metadata.language = optional_string_value(batch, "language", row);
  metadata.summary = optional_string_value(batch, "summary", row);
  metadata.extra = extra;

  Ok(SearchResult {
    chunk_id: string_value(batch, "chunk_id", row)?,
    text: string_value(batch, "text", row)?,
    metadata,
    score: 0.0,
    rerank_score: None,
    original_rank: None,
  })
}
