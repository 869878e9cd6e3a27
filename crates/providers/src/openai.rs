//! OpenAI-compatible embedding provider (`/v1/embeddings`).
//!
//! Works against any service speaking the OpenAI embeddings wire format.
//! The API key is read from the environment variable named in the
//! configuration at construction time; a missing key fails fast.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use recall_core::config::EmbeddingConfig;

use crate::{EmbedMode, Embedder, ProviderError, Result};

#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
  client: reqwest::Client,
  base_url: String,
  model: String,
  dimension: usize,
  api_key: String,
}

impl OpenAiEmbedder {
  pub fn new(config: &EmbeddingConfig) -> Result<Self> {
    let env = config
      .api_key_env
      .clone()
      .ok_or_else(|| ProviderError::MissingApiKey("embedding.api_key_env".to_string()))?;
    let api_key = std::env::var(&env).map_err(|_| ProviderError::MissingApiKey(env))?;

    debug!(
      base_url = %config.base_url,
      model = %config.model,
      dimension = config.dimension,
      "OpenAI-compatible embedder initialized"
    );

    Ok(Self {
      client: reqwest::Client::new(),
      base_url: config.base_url.clone(),
      model: config.model.clone(),
      dimension: config.dimension,
      api_key,
    })
  }

  fn embeddings_url(&self) -> String {
    format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
  }

  async fn request_batch(&self, inputs: Vec<&str>) -> Result<Vec<Vec<f32>>> {
    let expected = inputs.len();
    let request = EmbeddingsRequest {
      model: &self.model,
      input: inputs,
    };

    let response = self
      .client
      .post(self.embeddings_url())
      .bearer_auth(&self.api_key)
      .json(&request)
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, model = %self.model, "Embedding request failed");
      return Err(ProviderError::Provider(format!(
        "embeddings endpoint returned {}: {}",
        status, body
      )));
    }

    let result: EmbeddingsResponse = response.json().await?;

    if result.data.len() != expected {
      return Err(ProviderError::Provider(format!(
        "batch size mismatch: got {} embeddings for {} inputs",
        result.data.len(),
        expected
      )));
    }

    // The API may return entries out of order; `index` is authoritative.
    let mut ordered: Vec<(usize, Vec<f32>)> = result.data.into_iter().map(|d| (d.index, d.embedding)).collect();
    ordered.sort_by_key(|(index, _)| *index);

    let embeddings: Vec<Vec<f32>> = ordered.into_iter().map(|(_, embedding)| embedding).collect();
    for embedding in &embeddings {
      if embedding.len() != self.dimension {
        return Err(ProviderError::Dimension {
          expected: self.dimension,
          got: embedding.len(),
        });
      }
    }

    Ok(embeddings)
  }
}

#[async_trait::async_trait]
impl Embedder for OpenAiEmbedder {
  fn name(&self) -> &str {
    "openai"
  }

  fn model(&self) -> &str {
    &self.model
  }

  fn dimension(&self) -> usize {
    self.dimension
  }

  async fn embed(&self, text: &str, _mode: EmbedMode) -> Result<Vec<f32>> {
    let mut embeddings = self.request_batch(vec![text]).await?;
    embeddings
      .pop()
      .ok_or_else(|| ProviderError::Provider("empty embedding response".to_string()))
  }

  async fn embed_batch(&self, texts: &[&str], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }
    self.request_batch(texts.to_vec()).await
  }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
  model: &'a str,
  input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
  data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
  index: usize,
  embedding: Vec<f32>,
}
