//! The indexing pipeline.
//!
//! Stages, in order: resolve patterns, scan and classify, change
//! detection against the folder's file records, chunk, optional
//! enrichment (fail-open), embed in batches, then evict-then-upsert
//! against the storage backend. The manifest commit is performed by the
//! caller once the pipeline returns successfully.
//!
//! Cancellation is observed at stage boundaries and between embedding
//! batches, never mid-stage.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use recall_core::presets::{PresetError, resolve_presets};
use recall_core::types::{ChunkMetadata, EmbeddingMetadata, FileRecord, FolderRecord, compute_chunk_id};
use recall_providers::{EmbedMode, Embedder, ProviderError, Summarizer};
use recall_storage::{StorageBackend, StorageError, UpsertBatch};

use crate::scan::{ScanOptions, scan_folder};
use crate::splitter::{SplitParams, split_content};
use crate::{hash, language};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
  #[error(transparent)]
  Preset(#[from] PresetError),
  #[error("invalid input: {0}")]
  InvalidInput(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error(transparent)]
  Provider(#[from] ProviderError),
  #[error("indexing was cancelled")]
  Cancelled,
}

/// An indexing request for one canonicalized folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequest {
  /// Canonical folder path.
  pub folder: PathBuf,
  pub recursive: bool,
  /// Re-chunk and re-embed unchanged files too.
  pub force: bool,
  /// File-type preset names; resolved before the store is touched.
  #[serde(default)]
  pub include_types: Vec<String>,
  #[serde(default)]
  pub include_patterns: Vec<String>,
  #[serde(default)]
  pub exclude_patterns: Vec<String>,
}

impl IndexRequest {
  pub fn new(folder: PathBuf) -> Self {
    Self {
      folder,
      recursive: true,
      force: false,
      include_types: Vec::new(),
      include_patterns: Vec::new(),
      exclude_patterns: Vec::new(),
    }
  }
}

/// Progress counters, flushed to the caller at stage boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProgress {
  pub files_seen: usize,
  pub files_processed: usize,
  pub chunks_indexed: usize,
  pub chunks_evicted: usize,
}

/// Result of a successful pipeline run, ready for the manifest commit.
#[derive(Debug, Clone)]
pub struct IndexOutcome {
  pub progress: IndexProgress,
  /// File records for the folder after this run (retained + rebuilt).
  pub files: Vec<FileRecord>,
  /// All chunk ids now owned by the folder, in file order.
  pub chunk_ids: Vec<String>,
}

pub type ProgressFn = dyn Fn(&IndexProgress) + Send + Sync;

/// Everything the pipeline needs from the outside.
pub struct PipelineDeps {
  pub storage: Arc<dyn StorageBackend>,
  pub embedder: Arc<dyn Embedder>,
  pub summarizer: Option<Arc<dyn Summarizer>>,
  pub summarize_timeout: Duration,
  pub embed_batch_size: usize,
  pub split_params: SplitParams,
  pub max_file_size: u64,
}

struct PendingFile {
  path: String,
  content_hash: String,
  source_type: recall_core::types::SourceType,
  language: Option<language::Language>,
  absolute: PathBuf,
}

struct ChunkedFile {
  record: FileRecord,
  chunks: Vec<PendingChunk>,
}

struct PendingChunk {
  id: String,
  text: String,
  metadata: ChunkMetadata,
}

/// Run the full pipeline for one folder.
///
/// `previous` is the folder's current manifest record, used for change
/// detection; `force` bypasses it. The caller commits the returned
/// outcome to the manifest.
pub async fn run_pipeline(
  request: &IndexRequest,
  previous: Option<&FolderRecord>,
  deps: &PipelineDeps,
  progress: Option<&ProgressFn>,
  cancel: &CancellationToken,
) -> Result<IndexOutcome, IndexError> {
  let mut counters = IndexProgress::default();
  let flush = |counters: &IndexProgress| {
    if let Some(callback) = progress {
      callback(counters);
    }
  };
  let check_cancelled = || {
    if cancel.is_cancelled() {
      Err(IndexError::Cancelled)
    } else {
      Ok(())
    }
  };

  // Stage 1: resolve patterns. Unknown presets fail before any I/O.
  let mut include_patterns = resolve_presets(&request.include_types)?;
  for pattern in &request.include_patterns {
    if !include_patterns.iter().any(|p| p == pattern) {
      include_patterns.push(pattern.clone());
    }
  }
  check_cancelled()?;

  // Stage 2: scan, classify, hash.
  let scanned = scan_folder(
    &request.folder,
    &ScanOptions {
      recursive: request.recursive,
      include_patterns,
      exclude_patterns: request.exclude_patterns.clone(),
      max_file_size: deps.max_file_size,
    },
  )?;
  counters.files_seen = scanned.len();
  flush(&counters);
  check_cancelled()?;

  let mut hashed = Vec::with_capacity(scanned.len());
  for file in scanned {
    let content_hash = hash::hash_file(&file.path).await?;
    hashed.push(PendingFile {
      path: file.path.to_string_lossy().to_string(),
      content_hash,
      source_type: file.source_type,
      language: file.language,
      absolute: file.path,
    });
  }
  check_cancelled()?;

  // Stage 3: change detection. Unchanged files are retained, changed
  // files contribute their old chunks to the eviction set, and files
  // that disappeared evict everything they owned.
  let mut evictions: Vec<String> = Vec::new();
  let mut retained: Vec<FileRecord> = Vec::new();
  let mut to_process: Vec<PendingFile> = Vec::new();
  let seen_paths: HashSet<String> = hashed.iter().map(|f| f.path.clone()).collect();

  for file in hashed {
    match previous.and_then(|record| record.file(&file.path)) {
      Some(old) if old.content_hash == file.content_hash && !request.force => {
        retained.push(old.clone());
      }
      Some(old) => {
        evictions.extend(old.chunk_ids.iter().cloned());
        to_process.push(file);
      }
      None => to_process.push(file),
    }
  }

  if let Some(record) = previous {
    for old in &record.files {
      if !seen_paths.contains(&old.path) {
        debug!(path = %old.path, chunks = old.chunk_ids.len(), "File removed since last index");
        evictions.extend(old.chunk_ids.iter().cloned());
      }
    }
  }
  check_cancelled()?;

  // Stage 4: chunk.
  let mut chunked: Vec<ChunkedFile> = Vec::new();
  for file in to_process {
    let content = match tokio::fs::read_to_string(&file.absolute).await {
      Ok(content) => content,
      Err(e) => {
        warn!(path = %file.path, err = %e, "Skipping unreadable file");
        continue;
      }
    };

    let file_name = file
      .absolute
      .file_name()
      .map(|n| n.to_string_lossy().to_string())
      .unwrap_or_default();

    let pieces = split_content(&content, file.language, &deps.split_params);
    let mut chunks = Vec::with_capacity(pieces.len());
    for (index, piece) in pieces.into_iter().enumerate() {
      let id = compute_chunk_id(&file.path, index, &piece.body);
      let mut metadata = ChunkMetadata::new(file.path.clone(), file_name.clone(), file.source_type);
      metadata.language = file.language.map(|l| l.as_str().to_string());
      metadata.extra.insert("chunk_index".into(), index.to_string());
      metadata.extra.insert("char_offset".into(), piece.offset.to_string());
      chunks.push(PendingChunk {
        id,
        text: piece.body,
        metadata,
      });
    }

    counters.files_processed += 1;
    chunked.push(ChunkedFile {
      record: FileRecord {
        path: file.path,
        content_hash: file.content_hash,
        chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
      },
      chunks,
    });
  }
  flush(&counters);
  check_cancelled()?;

  // Stage 5: enrich. Per-chunk failures are logged and the unenriched
  // chunk proceeds.
  if let Some(ref summarizer) = deps.summarizer {
    for file in &mut chunked {
      for chunk in &mut file.chunks {
        match tokio::time::timeout(deps.summarize_timeout, summarizer.summarize(&chunk.text)).await {
          Ok(Ok(summary)) if !summary.is_empty() => chunk.metadata.summary = Some(summary),
          Ok(Ok(_)) => {}
          Ok(Err(e)) => warn!(chunk_id = %chunk.id, err = %e, "Enrichment failed, continuing unenriched"),
          Err(_) => warn!(chunk_id = %chunk.id, "Enrichment timed out, continuing unenriched"),
        }
      }
    }
    check_cancelled()?;
  }

  // Stage 6: embed in batches. Any dimension disagreement is fatal.
  let all_chunks: Vec<&PendingChunk> = chunked.iter().flat_map(|f| f.chunks.iter()).collect();
  let expected_dimension = deps.embedder.dimension();
  let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(all_chunks.len());

  for batch in all_chunks.chunks(deps.embed_batch_size.max(1)) {
    check_cancelled()?;
    let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
    let batch_embeddings = deps.embedder.embed_batch(&texts, EmbedMode::Document).await?;
    for embedding in &batch_embeddings {
      if embedding.len() != expected_dimension {
        return Err(IndexError::Provider(ProviderError::Dimension {
          expected: expected_dimension,
          got: embedding.len(),
        }));
      }
    }
    embeddings.extend(batch_embeddings);
  }
  check_cancelled()?;

  // Stage 7: evict then upsert. The two steps are not atomic; a failed
  // upsert after a successful eviction leaves the manifest unchanged for
  // those files, and the next run rebuilds them.
  if !evictions.is_empty() {
    counters.chunks_evicted = deps.storage.delete_by_ids(&evictions).await?;
  }

  if !all_chunks.is_empty() {
    deps
      .storage
      .set_embedding_metadata(&EmbeddingMetadata {
        provider: deps.embedder.name().to_string(),
        model: deps.embedder.model().to_string(),
        dimension: expected_dimension,
      })
      .await?;

    let upsert = UpsertBatch {
      ids: all_chunks.iter().map(|c| c.id.clone()).collect(),
      embeddings,
      documents: all_chunks.iter().map(|c| c.text.clone()).collect(),
      metadatas: all_chunks.iter().map(|c| c.metadata.clone()).collect(),
    };
    counters.chunks_indexed = deps.storage.upsert_documents(upsert).await?;
  }
  flush(&counters);

  // Assemble the folder's new state: retained records plus rebuilt ones,
  // ordered by path for a stable manifest.
  let mut files: Vec<FileRecord> = retained;
  files.extend(chunked.into_iter().map(|f| f.record));
  files.sort_by(|a, b| a.path.cmp(&b.path));
  let chunk_ids: Vec<String> = files.iter().flat_map(|f| f.chunk_ids.iter().cloned()).collect();

  info!(
    folder = %request.folder.display(),
    files_seen = counters.files_seen,
    files_processed = counters.files_processed,
    chunks_indexed = counters.chunks_indexed,
    chunks_evicted = counters.chunks_evicted,
    "Indexing pipeline complete"
  );

  Ok(IndexOutcome {
    progress: counters,
    files,
    chunk_ids,
  })
}
