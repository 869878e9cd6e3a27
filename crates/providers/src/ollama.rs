//! Ollama embedding provider using the native batch `/api/embed` endpoint.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use recall_core::config::EmbeddingConfig;

use crate::{EmbedMode, Embedder, ProviderError, Result};

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
  client: reqwest::Client,
  base_url: String,
  model: String,
  dimension: usize,
  /// Optional task instruction prepended to queries.
  /// When set and non-empty, queries become `Instruct: {instruction}\nQuery:{query}`.
  query_instruction: Option<String>,
}

impl OllamaEmbedder {
  pub fn new(config: &EmbeddingConfig) -> Result<Self> {
    debug!(
      base_url = %config.base_url,
      model = %config.model,
      dimension = config.dimension,
      "Ollama embedder initialized"
    );
    Ok(Self {
      client: reqwest::Client::new(),
      base_url: config.base_url.clone(),
      model: config.model.clone(),
      dimension: config.dimension,
      query_instruction: config.query_instruction.clone(),
    })
  }

  fn embed_url(&self) -> String {
    format!("{}/api/embed", self.base_url)
  }

  fn format_for_embedding(&self, text: &str, mode: EmbedMode) -> String {
    match mode {
      EmbedMode::Query => {
        if let Some(ref instruction) = self.query_instruction
          && !instruction.is_empty()
        {
          return format!("Instruct: {}\nQuery:{}", instruction, text);
        }
        text.to_string()
      }
      EmbedMode::Document => text.to_string(),
    }
  }

  async fn request_batch(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
    let expected = inputs.len();
    let request = EmbedRequest {
      model: &self.model,
      input: inputs,
    };

    let start = Instant::now();
    let response = self.client.post(self.embed_url()).json(&request).send().await?;

    trace!(
      status = %response.status(),
      elapsed_ms = start.elapsed().as_millis(),
      "Received embedding response"
    );

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, model = %self.model, "Ollama embedding request failed");
      return Err(ProviderError::Provider(format!("Ollama returned {}: {}", status, body)));
    }

    let result: EmbedResponse = response.json().await?;

    if result.embeddings.len() != expected {
      return Err(ProviderError::Provider(format!(
        "batch size mismatch: got {} embeddings for {} inputs",
        result.embeddings.len(),
        expected
      )));
    }

    for embedding in &result.embeddings {
      if embedding.len() != self.dimension {
        return Err(ProviderError::Dimension {
          expected: self.dimension,
          got: embedding.len(),
        });
      }
    }

    Ok(result.embeddings)
  }
}

#[async_trait::async_trait]
impl Embedder for OllamaEmbedder {
  fn name(&self) -> &str {
    "ollama"
  }

  fn model(&self) -> &str {
    &self.model
  }

  fn dimension(&self) -> usize {
    self.dimension
  }

  async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>> {
    let formatted = self.format_for_embedding(text, mode);
    let mut embeddings = self.request_batch(vec![formatted]).await?;
    embeddings
      .pop()
      .ok_or_else(|| ProviderError::Provider("empty embedding response".to_string()))
  }

  async fn embed_batch(&self, texts: &[&str], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }
    let formatted: Vec<String> = texts.iter().map(|t| self.format_for_embedding(t, mode)).collect();
    self.request_batch(formatted).await
  }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
  model: &'a str,
  input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
  embeddings: Vec<Vec<f32>>,
}
