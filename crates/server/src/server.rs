//! The Recall server: process-wide services with an explicit
//! start/shutdown lifecycle, and the operation surface exposed to an
//! enclosing transport layer.
//!
//! Startup validates configuration (fatal under strict_mode), constructs
//! the providers, initializes the storage backend, verifies embedding
//! dimension compatibility against the store's bound metadata, recovers
//! persisted jobs, and spawns the single indexing worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use recall_core::config::Config;
use recall_core::failure::Failure;
use recall_core::paths::canonical_folder;
use recall_core::presets::{preset_names, preset_patterns, resolve_presets};
use recall_core::types::FolderRecord;
use recall_index::{IndexRequest, PipelineDeps};
use recall_index::splitter::SplitParams;
use recall_providers::{Embedder, Reranker, Summarizer, embedder_from_config, reranker_from_config, summarizer_from_config};
use recall_storage::{StorageBackend, open_backend};

use crate::error::ServerError;
use crate::folders::FolderManager;
use crate::health::{HealthSnapshot, IndexingHealth, ProviderHealth, ProviderInfo, RunningJobSummary, StorageHealth};
use crate::jobs::{Job, JobQueue, JobStatus, Worker};
use crate::query::{QueryEngine, QueryOutcome, QueryRequest};

/// Receipt returned by `enqueue_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReceipt {
  pub job_id: String,
  /// 1-indexed position in the pending queue at enqueue time.
  pub position: usize,
}

/// Result of a folder removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveOutcome {
  pub chunks_deleted: usize,
}

/// One entry of the preset registry, for the types listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetInfo {
  pub name: String,
  pub patterns: Vec<String>,
}

pub struct RecallServer {
  config: Config,
  storage: Arc<dyn StorageBackend>,
  embedder: Arc<dyn Embedder>,
  summarizer: Option<Arc<dyn Summarizer>>,
  reranker: Option<Arc<dyn Reranker>>,
  folders: Arc<FolderManager>,
  queue: Arc<JobQueue>,
  query_engine: QueryEngine,
  cancel: CancellationToken,
  worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RecallServer {
  /// Start the server: validate, connect, recover, spawn the worker.
  pub async fn start(config: Config, state_dir: PathBuf) -> Result<Self, Failure> {
    let warnings = config.validate();
    config.enforce(&warnings)?;

    tokio::fs::create_dir_all(&state_dir)
      .await
      .map_err(|e| Failure::startup(format!("cannot create state directory {}: {}", state_dir.display(), e)))?;

    let embedder = embedder_from_config(&config.embedding).map_err(fail)?;
    let summarizer = summarizer_from_config(&config.summarization).map_err(fail)?;
    let reranker = if config.reranking.enabled {
      Some(reranker_from_config(&config.reranker).map_err(fail)?)
    } else {
      None
    };

    let storage = open_backend(&config, embedder.dimension(), &state_dir).map_err(fail)?;
    storage.initialize().await.map_err(fail)?;

    // Dimension compatibility: the store's bound dimension must match
    // the configured embedder, or startup is fatal.
    if let Some(stored) = storage.get_embedding_metadata().await.map_err(fail)? {
      if stored.dimension != embedder.dimension() {
        return Err(Failure::dimension_mismatch(stored.dimension, embedder.dimension()));
      }
      info!(
        provider = %stored.provider,
        model = %stored.model,
        dimension = stored.dimension,
        "Store bound to embedding model"
      );
    }

    let folders = Arc::new(FolderManager::load(&state_dir).await.map_err(fail)?);
    let queue = Arc::new(JobQueue::load(&state_dir, config.index.job_retention).await.map_err(fail)?);

    let deps = Arc::new(PipelineDeps {
      storage: Arc::clone(&storage),
      embedder: Arc::clone(&embedder),
      summarizer: summarizer.clone(),
      summarize_timeout: Duration::from_secs(config.summarization.timeout_secs),
      embed_batch_size: config.embedding.batch_size,
      split_params: SplitParams {
        target_tokens: config.index.doc_target_tokens,
        overlap_tokens: config.index.doc_overlap_tokens,
      },
      max_file_size: config.index.max_file_size,
    });

    let cancel = CancellationToken::new();
    let worker = Worker {
      queue: Arc::clone(&queue),
      folders: Arc::clone(&folders),
      deps,
    }
    .spawn(cancel.child_token());

    let query_engine = QueryEngine::new(
      Arc::clone(&storage),
      Arc::clone(&embedder),
      reranker.clone(),
      Duration::from_secs(config.reranker.timeout_secs),
      config.query.clone(),
      config.reranking.clone(),
    );

    info!(
      backend = config.storage.backend.as_str(),
      embedder = embedder.name(),
      model = embedder.model(),
      dimension = embedder.dimension(),
      state_dir = %state_dir.display(),
      "Recall server started"
    );

    Ok(Self {
      config,
      storage,
      embedder,
      summarizer,
      reranker,
      folders,
      queue,
      query_engine,
      cancel,
      worker: tokio::sync::Mutex::new(Some(worker)),
    })
  }

  /// Stop the worker and release storage handles.
  pub async fn shutdown(&self) {
    info!("Recall server shutting down");
    self.cancel.cancel();
    if let Some(handle) = self.worker.lock().await.take() {
      let _ = handle.await;
    }
    if let Err(e) = self.storage.close().await {
      warn!(err = %e, "Error while closing storage");
    }
  }

  // ==========================================================================
  // Index & folders
  // ==========================================================================

  /// Validate and enqueue an indexing job for a folder.
  ///
  /// Preset validation happens here, synchronously: an unknown preset is
  /// a Configuration failure and no job is created.
  pub async fn enqueue_index(&self, request: IndexRequest) -> Result<EnqueueReceipt, Failure> {
    if request.folder.as_os_str().is_empty() {
      return Err(Failure::invalid_input("folder path must not be empty"));
    }
    resolve_presets(&request.include_types).map_err(|e| Failure::configuration(e.to_string()))?;

    let canonical = canonical_folder(&request.folder)
      .map_err(|e| Failure::invalid_input(format!("folder {} is not accessible: {}", request.folder.display(), e)))?;
    if !canonical.is_dir() {
      return Err(Failure::invalid_input(format!("{} is not a directory", canonical.display())));
    }

    let request = IndexRequest {
      folder: canonical.clone(),
      ..request
    };
    let (job_id, position) = self
      .queue
      .enqueue(canonical.to_string_lossy().to_string(), request)
      .await
      .map_err(ServerError::into_failure)?;

    Ok(EnqueueReceipt { job_id, position })
  }

  pub async fn list_folders(&self) -> Vec<FolderRecord> {
    self.folders.list_folders().await
  }

  /// Remove an indexed folder: delete its chunks, then its record.
  ///
  /// Rejected with a Conflict failure while an indexing job targets the
  /// same canonical folder.
  pub async fn remove_folder(&self, folder: &Path) -> Result<RemoveOutcome, Failure> {
    let canonical = match canonical_folder(folder) {
      Ok(path) => path.to_string_lossy().to_string(),
      // The directory may already be gone from disk; fall back to the
      // spelling stored in the manifest.
      Err(_) => folder.to_string_lossy().to_string(),
    };

    remove_folder_guarded(&self.queue, &self.folders, &self.storage, &canonical)
      .await
      .map(|chunks_deleted| RemoveOutcome { chunks_deleted })
      .map_err(ServerError::into_failure)
  }

  // ==========================================================================
  // Jobs
  // ==========================================================================

  pub fn get_job(&self, id: &str) -> Result<Job, Failure> {
    self
      .queue
      .get_job(id)
      .ok_or_else(|| Failure::not_found(format!("job {} is unknown", id)))
  }

  pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
    self.queue.list_jobs(status)
  }

  pub async fn cancel_job(&self, id: &str) -> Result<(), Failure> {
    self.queue.cancel(id).await.map_err(ServerError::into_failure)
  }

  pub fn get_running_job(&self) -> Option<Job> {
    self.queue.get_running_job()
  }

  // ==========================================================================
  // Query, types, health
  // ==========================================================================

  pub async fn query(&self, request: &QueryRequest) -> Result<QueryOutcome, Failure> {
    self.query_engine.execute(request).await.map_err(ServerError::into_failure)
  }

  pub fn list_presets(&self) -> Vec<PresetInfo> {
    preset_names()
      .into_iter()
      .map(|name| PresetInfo {
        name: name.to_string(),
        patterns: preset_patterns(name)
          .unwrap_or(&[])
          .iter()
          .map(|p| p.to_string())
          .collect(),
      })
      .collect()
  }

  pub async fn health(&self) -> HealthSnapshot {
    let chunk_count = match self.storage.get_count().await {
      Ok(count) => Some(count),
      Err(e) => {
        warn!(err = %e, "Health: count query failed");
        None
      }
    };

    HealthSnapshot {
      storage: StorageHealth {
        backend: self.storage.kind().as_str().to_string(),
        initialized: self.storage.is_initialized(),
        chunk_count,
        dimension: self.embedder.dimension(),
      },
      providers: ProviderHealth {
        embedder: ProviderInfo {
          provider: self.embedder.name().to_string(),
          model: self.embedder.model().to_string(),
        },
        embedding_dimension: self.embedder.dimension(),
        summarizer: self.summarizer.as_ref().map(|s| ProviderInfo {
          provider: s.name().to_string(),
          model: s.model().to_string(),
        }),
        reranker: self.reranker.as_ref().map(|r| ProviderInfo {
          provider: r.name().to_string(),
          model: r.model().to_string(),
        }),
      },
      indexing: IndexingHealth {
        queue_depth: self.queue.depth(),
        running: self.queue.get_running_job().map(|job| RunningJobSummary {
          id: job.id,
          folder: job.folder,
          started_at: job.started_at,
          progress: job.progress,
        }),
      },
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }
}

/// Folder removal with the conflict guard, factored out so the guard is
/// testable without a live worker.
pub(crate) async fn remove_folder_guarded(
  queue: &JobQueue,
  folders: &FolderManager,
  storage: &Arc<dyn StorageBackend>,
  canonical: &str,
) -> Result<usize, ServerError> {
  if let Some(job) = queue.get_running_job()
    && job.folder == canonical
  {
    return Err(
      Failure::conflict(format!(
        "an indexing job ({}) is currently running for {}",
        job.id, canonical
      ))
      .into(),
    );
  }

  let Some(record) = folders.get_folder(canonical).await else {
    return Err(Failure::not_found(format!("folder {} is not indexed", canonical)).into());
  };

  // Chunks first, then the record; an orphaned record is recoverable,
  // orphaned chunks are not reachable for cleanup.
  let chunks_deleted = storage.delete_by_ids(&record.chunk_ids).await?;
  folders.remove_record(canonical).await?;

  info!(folder = %canonical, chunks_deleted, "Folder removed");
  Ok(chunks_deleted)
}

fn fail<E: Into<ServerError>>(error: E) -> Failure {
  error.into().into_failure()
}
