//! Retrying embedder wrapper with timeouts and exponential backoff.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use recall_core::config::EmbeddingConfig;

use crate::{EmbedMode, Embedder, ProviderError, Result};

/// Retry policy for remote embedding calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  /// Maximum number of retry attempts after the first failure
  pub max_retries: u32,
  /// Initial backoff duration
  pub initial_backoff: Duration,
  /// Maximum backoff duration
  pub max_backoff: Duration,
  /// Per-request timeout
  pub request_timeout: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(30),
      request_timeout: Duration::from_secs(30),
    }
  }
}

impl RetryConfig {
  pub fn from_embedding(config: &EmbeddingConfig) -> Self {
    Self {
      request_timeout: Duration::from_secs(config.timeout_secs),
      ..Default::default()
    }
  }

  /// Backoff for a given attempt: doubling from the initial value with
  /// up to 25% jitter, capped at `max_backoff`.
  pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
    let base = self.initial_backoff.as_secs_f64() * 2f64.powi(attempt as i32);
    let mut backoff = Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()));

    let jitter_factor = 1.0 + (subsec_rand() * 0.25);
    backoff = Duration::from_secs_f64(backoff.as_secs_f64() * jitter_factor);

    backoff.min(self.max_backoff)
  }
}

/// Sub-second clock noise as a jitter source; avoids an RNG dependency.
fn subsec_rand() -> f64 {
  use std::time::{SystemTime, UNIX_EPOCH};

  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .subsec_nanos();

  (nanos as f64 / u32::MAX as f64).fract()
}

/// Whether an error is worth retrying.
pub fn is_retryable(error: &ProviderError) -> bool {
  match error {
    ProviderError::Timeout => true,
    ProviderError::Request(e) => e.is_timeout() || e.is_connect(),
    ProviderError::Provider(msg) => {
      msg.contains("429") || msg.contains("502") || msg.contains("503") || msg.contains("504")
    }
    _ => false,
  }
}

/// Wraps an embedder with per-call timeouts and retry with backoff.
pub struct ResilientEmbedder<E: Embedder> {
  inner: E,
  config: RetryConfig,
}

impl<E: Embedder> ResilientEmbedder<E> {
  pub fn new(inner: E, config: RetryConfig) -> Self {
    Self { inner, config }
  }

  async fn with_retry<'a, F, Fut, T>(&'a self, operation: F) -> Result<T>
  where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'a,
  {
    let mut last_error = None;

    for attempt in 0..=self.config.max_retries {
      if attempt > 0 {
        let backoff = self.config.backoff_for_attempt(attempt - 1);
        debug!(
          attempt = attempt,
          max_retries = self.config.max_retries,
          backoff_ms = backoff.as_millis(),
          "Retrying embedding call after backoff"
        );
        sleep(backoff).await;
      }

      match tokio::time::timeout(self.config.request_timeout, operation()).await {
        Ok(Ok(result)) => {
          if attempt > 0 {
            debug!(attempt = attempt, "Embedding call succeeded after retry");
          }
          return Ok(result);
        }
        Ok(Err(e)) => {
          if is_retryable(&e) && attempt < self.config.max_retries {
            warn!(attempt = attempt + 1, err = %e, "Retryable embedding error");
            last_error = Some(e);
            continue;
          }
          return Err(e);
        }
        Err(_) => {
          warn!(
            attempt = attempt + 1,
            timeout_ms = self.config.request_timeout.as_millis(),
            "Embedding call timed out"
          );
          last_error = Some(ProviderError::Timeout);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| ProviderError::Provider("retries exhausted".to_string())))
  }
}

#[async_trait::async_trait]
impl<E: Embedder> Embedder for ResilientEmbedder<E> {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn model(&self) -> &str {
    self.inner.model()
  }

  fn dimension(&self) -> usize {
    self.inner.dimension()
  }

  async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>> {
    self.with_retry(|| self.inner.embed(text, mode)).await
  }

  async fn embed_batch(&self, texts: &[&str], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
    self.with_retry(|| self.inner.embed_batch(texts, mode)).await
  }
}
