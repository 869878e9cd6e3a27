//! Query engine: keyword, vector, hybrid, multi-fusion, and the graph
//! extension point, with optional two-stage reranking.
//!
//! Every path returns scores in [0, 1], higher is better, regardless of
//! backend or mode.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use recall_core::config::{QueryConfig, RerankingConfig};
use recall_core::failure::Failure;
use recall_core::types::SearchResult;
use recall_providers::{EmbedMode, Embedder, Reranker};
use recall_storage::fusion::{RankedList, reciprocal_rank_fusion};
use recall_storage::StorageBackend;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
  Keyword,
  Vector,
  Hybrid,
  Multi,
  Graph,
}

impl FromStr for QueryMode {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "keyword" => Ok(QueryMode::Keyword),
      "vector" => Ok(QueryMode::Vector),
      "hybrid" => Ok(QueryMode::Hybrid),
      "multi" => Ok(QueryMode::Multi),
      "graph" => Ok(QueryMode::Graph),
      other => Err(format!("unknown query mode: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
  pub text: String,
  pub top_k: usize,
  pub mode: QueryMode,
  /// Hybrid fusion weights; engine defaults apply when unset.
  #[serde(default)]
  pub vector_weight: Option<f32>,
  #[serde(default)]
  pub keyword_weight: Option<f32>,
  #[serde(default)]
  pub similarity_threshold: Option<f32>,
}

impl QueryRequest {
  pub fn new(text: impl Into<String>, top_k: usize, mode: QueryMode) -> Self {
    Self {
      text: text.into(),
      top_k,
      mode,
      vector_weight: None,
      keyword_weight: None,
      similarity_threshold: None,
    }
  }
}

/// Results plus diagnostics: which multi-fusion signals were silently
/// omitted, and whether the reranker actually ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
  pub results: Vec<SearchResult>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub omitted_signals: Vec<String>,
  #[serde(default)]
  pub reranked: bool,
}

pub struct QueryEngine {
  storage: Arc<dyn StorageBackend>,
  embedder: Arc<dyn Embedder>,
  reranker: Option<Arc<dyn Reranker>>,
  rerank_timeout: Duration,
  query_config: QueryConfig,
  reranking: RerankingConfig,
}

impl QueryEngine {
  pub fn new(
    storage: Arc<dyn StorageBackend>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    rerank_timeout: Duration,
    query_config: QueryConfig,
    reranking: RerankingConfig,
  ) -> Self {
    Self {
      storage,
      embedder,
      reranker,
      rerank_timeout,
      query_config,
      reranking,
    }
  }

  pub async fn execute(&self, request: &QueryRequest) -> Result<QueryOutcome> {
    if request.text.trim().is_empty() {
      return Err(Failure::invalid_input("query text must not be empty").into());
    }
    if request.top_k == 0 {
      return Err(Failure::invalid_input("top_k must be greater than zero").into());
    }

    if request.mode == QueryMode::Graph && !self.storage.capabilities().graph {
      return Err(
        Failure::configuration(format!(
          "graph mode is not supported by the {} backend",
          self.storage.kind().as_str()
        ))
        .with_hint("use mode=multi, which fuses the available signals")
        .into(),
      );
    }

    let rerank_active = self.reranking.enabled && self.reranker.is_some();
    let stage1_k = if rerank_active {
      (request.top_k * self.reranking.multiplier)
        .min(self.reranking.max_candidates)
        .max(request.top_k)
    } else {
      request.top_k
    };

    let (stage1, omitted_signals) = self.run_mode(request, stage1_k).await?;

    if !rerank_active {
      return Ok(QueryOutcome {
        results: stage1,
        omitted_signals,
        reranked: false,
      });
    }

    let (results, reranked) = self.rerank(&request.text, stage1, request.top_k).await;
    Ok(QueryOutcome {
      results,
      omitted_signals,
      reranked,
    })
  }

  async fn run_mode(&self, request: &QueryRequest, top_k: usize) -> Result<(Vec<SearchResult>, Vec<String>)> {
    let threshold = request
      .similarity_threshold
      .unwrap_or(self.query_config.similarity_threshold);

    match request.mode {
      QueryMode::Keyword => Ok((self.storage.keyword_search(&request.text, top_k).await?, Vec::new())),
      QueryMode::Vector => {
        let embedding = self.embedder.embed(&request.text, EmbedMode::Query).await?;
        Ok((self.storage.vector_search(&embedding, top_k, threshold).await?, Vec::new()))
      }
      QueryMode::Hybrid => {
        let embedding = self.embedder.embed(&request.text, EmbedMode::Query).await?;
        let vector_weight = request.vector_weight.unwrap_or(self.query_config.vector_weight);
        let keyword_weight = request.keyword_weight.unwrap_or(self.query_config.keyword_weight);
        Ok((
          self
            .storage
            .hybrid_search(&request.text, &embedding, top_k, vector_weight, keyword_weight)
            .await?,
          Vec::new(),
        ))
      }
      QueryMode::Multi => self.multi_search(request, top_k).await,
      QueryMode::Graph => unreachable!("graph capability is checked before dispatch"),
    }
  }

  /// Second-layer fusion across the keyword, vector, and hybrid
  /// signals. Signals the backend cannot serve are silently omitted and
  /// reported in the outcome's diagnostics.
  async fn multi_search(&self, request: &QueryRequest, top_k: usize) -> Result<(Vec<SearchResult>, Vec<String>)> {
    let capabilities = self.storage.capabilities();
    let fetch = top_k.saturating_mul(self.query_config.multi_fetch_multiplier.max(1));
    let threshold = request
      .similarity_threshold
      .unwrap_or(self.query_config.similarity_threshold);

    let mut omitted = Vec::new();

    let keyword_results = if capabilities.keyword {
      self.storage.keyword_search(&request.text, fetch).await?
    } else {
      omitted.push("keyword".to_string());
      Vec::new()
    };

    let (vector_results, hybrid_results) = if capabilities.vector {
      let embedding = self.embedder.embed(&request.text, EmbedMode::Query).await?;
      let vector = self.storage.vector_search(&embedding, fetch, threshold).await?;
      let hybrid = if capabilities.keyword {
        self
          .storage
          .hybrid_search(
            &request.text,
            &embedding,
            fetch,
            self.query_config.vector_weight,
            self.query_config.keyword_weight,
          )
          .await?
      } else {
        omitted.push("hybrid".to_string());
        Vec::new()
      };
      (vector, hybrid)
    } else {
      omitted.push("vector".to_string());
      omitted.push("hybrid".to_string());
      (Vec::new(), Vec::new())
    };

    if !omitted.is_empty() {
      debug!(omitted = ?omitted, "Multi fusion proceeding without unavailable signals");
    }

    let fused = reciprocal_rank_fusion(
      &[
        RankedList::new(self.query_config.multi_keyword_weight, &keyword_results),
        RankedList::tie_breaking(self.query_config.multi_vector_weight, &vector_results),
        RankedList::new(self.query_config.multi_hybrid_weight, &hybrid_results),
      ],
      top_k,
    );

    Ok((fused, omitted))
  }

  /// Two-stage reranking. Fail-open: any reranker failure or timeout
  /// returns the stage-1 list unchanged.
  async fn rerank(&self, query: &str, stage1: Vec<SearchResult>, top_k: usize) -> (Vec<SearchResult>, bool) {
    let Some(ref reranker) = self.reranker else {
      return (truncated(stage1, top_k), false);
    };
    if stage1.is_empty() {
      return (stage1, false);
    }

    let documents: Vec<&str> = stage1.iter().map(|r| r.text.as_str()).collect();
    let outcome = tokio::time::timeout(self.rerank_timeout, reranker.rerank(query, &documents, top_k)).await;

    match outcome {
      Ok(Ok(ranked)) => {
        let results = ranked
          .into_iter()
          .filter(|doc| doc.index < stage1.len())
          .map(|doc| {
            let original = &stage1[doc.index];
            let score = doc.score.clamp(0.0, 1.0);
            SearchResult {
              score,
              rerank_score: Some(score),
              original_rank: Some(doc.index + 1),
              ..original.clone()
            }
          })
          .collect();
        (results, true)
      }
      Ok(Err(e)) => {
        warn!(err = %e, "Reranker failed, returning stage-1 results unchanged");
        (truncated(stage1, top_k), false)
      }
      Err(_) => {
        warn!(timeout_ms = self.rerank_timeout.as_millis(), "Reranker timed out, returning stage-1 results");
        (truncated(stage1, top_k), false)
      }
    }
  }
}

fn truncated(mut results: Vec<SearchResult>, top_k: usize) -> Vec<SearchResult> {
  results.truncate(top_k);
  results
}
