//! Storage backends for Recall.
//!
//! A single [`StorageBackend`] contract is served by two implementations:
//! an embedded vector store ([`EmbeddedStore`], LanceDB with an auxiliary
//! lexical index) and a relational engine ([`RelationalStore`], Postgres
//! with the `vector` extension and a weighted text-search column). Every
//! backend normalizes scores into [0, 1] (higher is better) so callers
//! never need to know which implementation is active.

pub mod embedded;
pub mod fusion;
pub mod relational;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use recall_core::config::{BackendKind, Config, DistanceMetric};
use recall_core::types::{ChunkMetadata, EmbeddingMetadata, SearchResult};

pub use embedded::EmbeddedStore;
pub use relational::RelationalStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("storage backend error: {0}")]
  Backend(String),
  #[error("arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("connection error: {0}")]
  Connection(String),
  #[error("invalid input: {0}")]
  InvalidInput(String),
  #[error("embedding dimension {configured} differs from stored dimension {stored}")]
  DimensionMismatch { stored: usize, configured: usize },
  #[error("vector extension unavailable: {0}")]
  ExtensionMissing(String),
  #[error("backend is not initialized; call initialize() first")]
  NotInitialized,
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// What the active backend can serve. Used by the query engine to gate
/// modes and silently omit unavailable signals in multi fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
  pub keyword: bool,
  pub vector: bool,
  pub graph: bool,
}

impl Default for BackendCapabilities {
  fn default() -> Self {
    Self {
      keyword: true,
      vector: true,
      graph: false,
    }
  }
}

/// A batch of documents for upsert. All four columns must be the same
/// length and every embedding must match the store's bound dimension.
#[derive(Debug, Clone, Default)]
pub struct UpsertBatch {
  pub ids: Vec<String>,
  pub embeddings: Vec<Vec<f32>>,
  pub documents: Vec<String>,
  pub metadatas: Vec<ChunkMetadata>,
}

impl UpsertBatch {
  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn validate(&self, dimension: usize) -> Result<()> {
    if self.embeddings.len() != self.ids.len()
      || self.documents.len() != self.ids.len()
      || self.metadatas.len() != self.ids.len()
    {
      return Err(StorageError::InvalidInput(format!(
        "upsert batch columns disagree: {} ids, {} embeddings, {} documents, {} metadatas",
        self.ids.len(),
        self.embeddings.len(),
        self.documents.len(),
        self.metadatas.len()
      )));
    }
    for (id, embedding) in self.ids.iter().zip(&self.embeddings) {
      if embedding.len() != dimension {
        return Err(StorageError::InvalidInput(format!(
          "embedding for chunk {} has dimension {}, store is bound to {}",
          id,
          embedding.len(),
          dimension
        )));
      }
    }
    Ok(())
  }
}

/// Uniform capability set exposed by both storage implementations.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
  fn kind(&self) -> BackendKind;

  fn capabilities(&self) -> BackendCapabilities {
    BackendCapabilities::default()
  }

  /// Bootstrap backend state: open the persistent handle, create schema
  /// objects if missing, read embedding metadata. Idempotent.
  async fn initialize(&self) -> Result<()>;

  fn is_initialized(&self) -> bool;

  /// Insert or replace rows by id; returns the count processed.
  async fn upsert_documents(&self, batch: UpsertBatch) -> Result<usize>;

  /// Delete exactly the listed ids, returning the number actually
  /// deleted. An empty id list is a no-op returning 0 - never "delete
  /// all".
  async fn delete_by_ids(&self, ids: &[String]) -> Result<usize>;

  /// Delete rows whose metadata exactly matches the filter. An empty
  /// filter is a no-op returning 0.
  async fn delete_by_metadata(&self, filter: &BTreeMap<String, String>) -> Result<usize>;

  /// Top-k nearest neighbors with scores normalized to [0, 1].
  async fn vector_search(&self, query_embedding: &[f32], top_k: usize, similarity_threshold: f32)
  -> Result<Vec<SearchResult>>;

  /// Lexical retrieval with per-query max normalization: the top result
  /// scores exactly 1.0 whenever there are any hits.
  async fn keyword_search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>>;

  async fn get_count(&self) -> Result<usize>;

  /// Drop all stored chunks and embedding metadata.
  async fn reset(&self) -> Result<()>;

  async fn get_embedding_metadata(&self) -> Result<Option<EmbeddingMetadata>>;

  /// Idempotent write. Repeated identical writes are allowed; writing a
  /// different dimension while data exists fails fast.
  async fn set_embedding_metadata(&self, metadata: &EmbeddingMetadata) -> Result<()>;

  /// Release pools and handles. No-op for file-backed backends.
  async fn close(&self) -> Result<()>;

  /// Reciprocal Rank Fusion over the two native signals.
  ///
  /// Fetches 2 x top_k from each of vector and keyword search (threshold
  /// 0, no filter), fuses with `weight / (60 + rank)`, min-max
  /// normalizes, and returns the top_k. Deterministic: ties break on the
  /// original vector score, then lexicographic chunk id.
  async fn hybrid_search(
    &self,
    query: &str,
    query_embedding: &[f32],
    top_k: usize,
    vector_weight: f32,
    keyword_weight: f32,
  ) -> Result<Vec<SearchResult>> {
    let fetch = top_k.saturating_mul(2).max(1);
    let vector_results = self.vector_search(query_embedding, fetch, 0.0).await?;
    let keyword_results = self.keyword_search(query, fetch).await?;

    Ok(fusion::reciprocal_rank_fusion(
      &[
        fusion::RankedList::tie_breaking(vector_weight, &vector_results),
        fusion::RankedList::new(keyword_weight, &keyword_results),
      ],
      top_k,
    ))
  }
}

/// Normalize a raw backend distance into a [0, 1] score, higher better.
///
/// Both backends report inner product negated as a distance; the raw
/// similarity recovered here still needs the per-batch min-max pass in
/// [`normalize_batch`].
pub fn normalize_distance(metric: DistanceMetric, distance: f32) -> f32 {
  match metric {
    DistanceMetric::Cosine => (1.0 - distance).clamp(0.0, 1.0),
    DistanceMetric::L2 => 1.0 / (1.0 + distance.max(0.0)),
    DistanceMetric::InnerProduct => -distance,
  }
}

/// Batch-level normalization pass applied after [`normalize_distance`].
/// A no-op for cosine and L2; min-max for inner product.
pub fn normalize_batch(metric: DistanceMetric, results: &mut [SearchResult]) {
  if metric != DistanceMetric::InnerProduct || results.is_empty() {
    return;
  }
  let max = results.iter().map(|r| r.score).fold(f32::MIN, f32::max);
  let min = results.iter().map(|r| r.score).fold(f32::MAX, f32::min);
  let range = max - min;
  for result in results.iter_mut() {
    result.score = if range > 0.0 { (result.score - min) / range } else { 1.0 };
  }
}

/// Normalize lexical scores by the batch max so the top hit is exactly 1.0.
pub fn normalize_by_max(results: &mut [SearchResult]) {
  let max = results.iter().map(|r| r.score).fold(0.0f32, f32::max);
  if max > 0.0 {
    for result in results.iter_mut() {
      result.score /= max;
    }
  } else if !results.is_empty() {
    for result in results.iter_mut() {
      result.score = 1.0;
    }
  }
}

/// Open the configured backend. The embedded store lives under
/// `state_dir`; the relational store connects to the configured service.
pub fn open_backend(config: &Config, dimension: usize, state_dir: &Path) -> Result<Arc<dyn StorageBackend>> {
  match config.storage.backend {
    BackendKind::Embedded => Ok(Arc::new(EmbeddedStore::new(
      state_dir.join("store"),
      dimension,
      config.storage.distance,
    ))),
    BackendKind::Relational => Ok(Arc::new(RelationalStore::new(
      &config.storage.relational,
      dimension,
      config.storage.distance,
    ))),
  }
}
