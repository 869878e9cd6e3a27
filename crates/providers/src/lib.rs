//! Provider capability contracts and their implementations.
//!
//! Three small interfaces cover everything the retrieval core needs from
//! model providers: [`Embedder`] (text to vector), [`Summarizer`] (text to
//! short text), and [`Reranker`] (query + documents to re-ordered
//! documents with scores). Concrete providers are registered by name at
//! startup from configuration; the registry is closed.

mod offline;
mod ollama;
mod openai;
mod rerank;
mod resilient;
mod summarize;

use std::sync::Arc;

pub use offline::HashEmbedder;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAiEmbedder;
pub use rerank::HttpReranker;
pub use resilient::{ResilientEmbedder, RetryConfig, is_retryable};
pub use summarize::{OllamaSummarizer, OpenAiSummarizer};

use recall_core::config::{CompletionProviderKind, EmbeddingConfig, EmbeddingProviderKind, RerankerConfig, SummarizationConfig};

/// How text is formatted before embedding.
///
/// Instruction-following embedding models produce better retrieval when
/// queries carry a task instruction while documents are embedded as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedMode {
  /// Embedding a document for storage. Text is embedded as-is.
  #[default]
  Document,
  /// Embedding a query for retrieval. An optional instruction prefix is
  /// applied by providers that support it.
  Query,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
  #[error("api key environment variable {0} is not set")]
  MissingApiKey(String),
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("provider error: {0}")]
  Provider(String),
  #[error("request timed out")]
  Timeout,
  #[error("provider returned dimension {got}, expected {expected}")]
  Dimension { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Text-to-vector capability.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
  fn name(&self) -> &str;
  fn model(&self) -> &str;
  fn dimension(&self) -> usize;

  async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>>;
  async fn embed_batch(&self, texts: &[&str], mode: EmbedMode) -> Result<Vec<Vec<f32>>>;
}

/// Text-to-short-text capability used for chunk enrichment.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
  fn name(&self) -> &str;
  fn model(&self) -> &str;

  async fn summarize(&self, text: &str) -> Result<String>;
}

/// A document re-ordered by a reranker.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankedDoc {
  /// Index into the caller's document slice.
  pub index: usize,
  /// Relevance score, higher is better.
  pub score: f32,
}

/// Query + documents to ordered documents with scores.
#[async_trait::async_trait]
pub trait Reranker: Send + Sync {
  fn name(&self) -> &str;
  fn model(&self) -> &str;

  /// Returns up to `top_k` entries ordered best-first.
  async fn rerank(&self, query: &str, documents: &[&str], top_k: usize) -> Result<Vec<RerankedDoc>>;
}

/// Build the configured embedder. Remote providers are wrapped with
/// retry/backoff; the offline embedder needs none.
pub fn embedder_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
  match config.provider {
    EmbeddingProviderKind::Offline => Ok(Arc::new(HashEmbedder::new(config))),
    EmbeddingProviderKind::Ollama => {
      let provider = OllamaEmbedder::new(config)?;
      Ok(Arc::new(ResilientEmbedder::new(provider, RetryConfig::from_embedding(config))))
    }
    EmbeddingProviderKind::OpenAi => {
      let provider = OpenAiEmbedder::new(config)?;
      Ok(Arc::new(ResilientEmbedder::new(provider, RetryConfig::from_embedding(config))))
    }
  }
}

/// Build the configured summarizer, or None when enrichment is disabled.
pub fn summarizer_from_config(config: &SummarizationConfig) -> Result<Option<Arc<dyn Summarizer>>> {
  if !config.enabled {
    return Ok(None);
  }
  let summarizer: Arc<dyn Summarizer> = match config.provider {
    CompletionProviderKind::Ollama => Arc::new(OllamaSummarizer::new(config)),
    CompletionProviderKind::OpenAi => Arc::new(OpenAiSummarizer::new(config)?),
  };
  Ok(Some(summarizer))
}

/// Build the configured reranker.
pub fn reranker_from_config(config: &RerankerConfig) -> Result<Arc<dyn Reranker>> {
  Ok(Arc::new(HttpReranker::new(config)?))
}
