//! Boundary-level failure taxonomy.
//!
//! Every operation Recall exposes to an enclosing server returns either a
//! success payload or a [`Failure`]: a kind, a human-readable message, an
//! optional actionable hint, and optional structured details. Internal
//! layers use their own `thiserror` enums and convert at the boundary.

use serde::{Deserialize, Serialize};

/// Classification of a boundary failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  /// Invalid or missing configuration, unknown preset, missing API key,
  /// or a mode the active backend cannot serve.
  Configuration,
  /// Backend unreachable or schema bootstrap failed during startup.
  Startup,
  /// Stored embedding dimension differs from the configured embedder.
  DimensionMismatch,
  /// A storage operation failed after startup.
  Storage,
  /// An embedder, summarizer, or reranker call failed.
  Provider,
  /// Malformed caller input (empty query, zero top_k, unknown mode).
  InvalidInput,
  /// Folder not indexed or job id unknown.
  NotFound,
  /// Operation conflicts with an in-flight job.
  Conflict,
  /// Explicit cancellation was observed.
  Cancelled,
  /// A logic invariant was violated.
  Internal,
}

impl FailureKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      FailureKind::Configuration => "configuration",
      FailureKind::Startup => "startup",
      FailureKind::DimensionMismatch => "dimension_mismatch",
      FailureKind::Storage => "storage",
      FailureKind::Provider => "provider",
      FailureKind::InvalidInput => "invalid_input",
      FailureKind::NotFound => "not_found",
      FailureKind::Conflict => "conflict",
      FailureKind::Cancelled => "cancelled",
      FailureKind::Internal => "internal",
    }
  }
}

/// Structured failure returned across the operation boundary.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{} error: {message}", .kind.as_str())]
pub struct Failure {
  pub kind: FailureKind,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub hint: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub details: Option<serde_json::Value>,
}

impl Failure {
  pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      hint: None,
      details: None,
    }
  }

  pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
    self.hint = Some(hint.into());
    self
  }

  pub fn with_details(mut self, details: serde_json::Value) -> Self {
    self.details = Some(details);
    self
  }

  pub fn configuration(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Configuration, message)
  }

  pub fn startup(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Startup, message)
  }

  /// Dimension mismatch carries the standard reset hint.
  pub fn dimension_mismatch(stored: usize, configured: usize) -> Self {
    Self::new(
      FailureKind::DimensionMismatch,
      format!(
        "embedding dimension {} differs from stored dimension {}",
        configured, stored
      ),
    )
    .with_hint("run reset and re-index, or restore the original embedding model")
  }

  pub fn storage(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Storage, message)
  }

  pub fn provider(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Provider, message)
  }

  pub fn invalid_input(message: impl Into<String>) -> Self {
    Self::new(FailureKind::InvalidInput, message)
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(FailureKind::NotFound, message)
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Conflict, message)
  }

  pub fn cancelled(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Cancelled, message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Internal, message)
  }
}
