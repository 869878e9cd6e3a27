//! Health snapshots exposed to the enclosing server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recall_index::IndexProgress;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealth {
  pub backend: String,
  pub initialized: bool,
  /// None when the count query itself failed.
  pub chunk_count: Option<usize>,
  pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
  pub provider: String,
  pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
  pub embedder: ProviderInfo,
  pub embedding_dimension: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub summarizer: Option<ProviderInfo>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reranker: Option<ProviderInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningJobSummary {
  pub id: String,
  pub folder: String,
  pub started_at: Option<DateTime<Utc>>,
  pub progress: IndexProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingHealth {
  pub queue_depth: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub running: Option<RunningJobSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
  pub storage: StorageHealth,
  pub providers: ProviderHealth,
  pub indexing: IndexingHealth,
}
