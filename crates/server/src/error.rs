//! Internal error type and its mapping onto the boundary failure
//! taxonomy.

use recall_core::failure::Failure;
use recall_index::IndexError;
use recall_providers::ProviderError;
use recall_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
  #[error(transparent)]
  Failure(#[from] Failure),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("serialization error: {0}")]
  Json(#[from] serde_json::Error),
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error(transparent)]
  Provider(#[from] ProviderError),
  #[error(transparent)]
  Index(#[from] IndexError),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
  /// Collapse into the structured failure reported at the operation
  /// boundary.
  pub fn into_failure(self) -> Failure {
    match self {
      ServerError::Failure(failure) => failure,
      ServerError::Io(e) => Failure::storage(format!("io error: {}", e)),
      ServerError::Json(e) => Failure::internal(format!("serialization error: {}", e)),
      ServerError::Storage(e) => storage_failure(e),
      ServerError::Provider(e) => Failure::provider(e.to_string()),
      ServerError::Index(e) => index_failure(e),
    }
  }
}

fn storage_failure(error: StorageError) -> Failure {
  match error {
    StorageError::DimensionMismatch { stored, configured } => Failure::dimension_mismatch(stored, configured),
    StorageError::ExtensionMissing(message) => Failure::startup(message)
      .with_hint("install the pgvector extension, e.g. via the shipped docker-compose template"),
    StorageError::Connection(message) => Failure::startup(message),
    StorageError::NotInitialized => Failure::startup("storage backend is not initialized"),
    StorageError::InvalidInput(message) => Failure::invalid_input(message),
    other => Failure::storage(other.to_string()),
  }
}

fn index_failure(error: IndexError) -> Failure {
  match error {
    IndexError::Preset(e) => Failure::configuration(e.to_string()),
    IndexError::InvalidInput(message) => Failure::invalid_input(message),
    IndexError::Cancelled => Failure::cancelled("indexing was cancelled"),
    IndexError::Storage(e) => storage_failure(e),
    IndexError::Provider(e) => Failure::provider(e.to_string()),
    IndexError::Io(e) => Failure::storage(format!("io error during indexing: {}", e)),
  }
}
