//! HTTP reranker speaking the common `/rerank` wire format
//! (`{model, query, documents, top_n}` in, `results[{index, relevance_score}]` out).

use serde::{Deserialize, Serialize};
use tracing::warn;

use recall_core::config::RerankerConfig;

use crate::{ProviderError, RerankedDoc, Reranker, Result};

pub struct HttpReranker {
  client: reqwest::Client,
  base_url: String,
  model: String,
  api_key: Option<String>,
}

impl HttpReranker {
  pub fn new(config: &RerankerConfig) -> Result<Self> {
    let api_key = match config.api_key_env.as_deref() {
      Some(env) => Some(std::env::var(env).map_err(|_| ProviderError::MissingApiKey(env.to_string()))?),
      None => None,
    };

    Ok(Self {
      client: reqwest::Client::new(),
      base_url: config.base_url.clone(),
      model: config.model.clone(),
      api_key,
    })
  }

  fn rerank_url(&self) -> String {
    format!("{}/rerank", self.base_url.trim_end_matches('/'))
  }
}

#[async_trait::async_trait]
impl Reranker for HttpReranker {
  fn name(&self) -> &str {
    "http"
  }

  fn model(&self) -> &str {
    &self.model
  }

  async fn rerank(&self, query: &str, documents: &[&str], top_k: usize) -> Result<Vec<RerankedDoc>> {
    if documents.is_empty() {
      return Ok(Vec::new());
    }

    let request = RerankRequest {
      model: &self.model,
      query,
      documents,
      top_n: top_k,
    };

    let mut builder = self.client.post(self.rerank_url()).json(&request);
    if let Some(ref key) = self.api_key {
      builder = builder.bearer_auth(key);
    }

    let response = builder.send().await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, model = %self.model, "Rerank request failed");
      return Err(ProviderError::Provider(format!(
        "rerank endpoint returned {}: {}",
        status, body
      )));
    }

    let result: RerankResponse = response.json().await?;

    let mut docs: Vec<RerankedDoc> = result
      .results
      .into_iter()
      .filter(|r| r.index < documents.len())
      .map(|r| RerankedDoc {
        index: r.index,
        score: r.relevance_score,
      })
      .collect();

    // Best-first regardless of how the endpoint ordered them.
    docs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    docs.truncate(top_k);
    Ok(docs)
  }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
  model: &'a str,
  query: &'a str,
  documents: &'a [&'a str],
  top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
  results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
  index: usize,
  relevance_score: f32,
}
