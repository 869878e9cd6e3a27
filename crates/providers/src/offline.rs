//! Deterministic local embedder.
//!
//! Feature-hashes character trigrams into a fixed-dimension vector and
//! L2-normalizes the result. No network, no model weights, stable across
//! runs and platforms. Useful as the default provider for offline setups
//! and as the embedder behind the integration suites.

use recall_core::config::EmbeddingConfig;

use crate::{EmbedMode, Embedder, Result};

#[derive(Debug, Clone)]
pub struct HashEmbedder {
  model: String,
  dimension: usize,
}

impl HashEmbedder {
  pub fn new(config: &EmbeddingConfig) -> Self {
    Self {
      model: config.model.clone(),
      dimension: config.dimension,
    }
  }

  pub fn with_dimension(dimension: usize) -> Self {
    Self {
      model: "hash-trigram".to_string(),
      dimension,
    }
  }

  fn embed_text(&self, text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; self.dimension];
    let normalized = text.to_lowercase();
    let chars: Vec<char> = normalized.chars().collect();

    if chars.is_empty() {
      return vector;
    }

    for window in chars.windows(3.min(chars.len())) {
      let mut hash = fnv1a(window);
      let bucket = (hash % self.dimension as u64) as usize;
      hash = hash.rotate_left(17);
      let sign = if hash & 1 == 0 { 1.0 } else { -1.0 };
      vector[bucket] += sign;
    }

    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
      for value in &mut vector {
        *value /= norm;
      }
    }
    vector
  }
}

/// FNV-1a over the UTF-8 bytes of a character window. Stable across
/// platforms, unlike the standard library's default hasher.
fn fnv1a(window: &[char]) -> u64 {
  const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
  const PRIME: u64 = 0x0000_0100_0000_01b3;

  let mut hash = OFFSET;
  let mut buf = [0u8; 4];
  for ch in window {
    for byte in ch.encode_utf8(&mut buf).as_bytes() {
      hash ^= u64::from(*byte);
      hash = hash.wrapping_mul(PRIME);
    }
  }
  hash
}

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
  fn name(&self) -> &str {
    "offline"
  }

  fn model(&self) -> &str {
    &self.model
  }

  fn dimension(&self) -> usize {
    self.dimension
  }

  async fn embed(&self, text: &str, _mode: EmbedMode) -> Result<Vec<f32>> {
    Ok(self.embed_text(text))
  }

  async fn embed_batch(&self, texts: &[&str], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
    Ok(texts.iter().map(|text| self.embed_text(text)).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_deterministic() {
    let embedder = HashEmbedder::with_dimension(128);
    let a = embedder.embed("espresso brewing guide", EmbedMode::Document).await.unwrap();
    let b = embedder.embed("espresso brewing guide", EmbedMode::Document).await.unwrap();
    assert_eq!(a, b);
  }

  #[tokio::test]
  async fn test_dimension_and_normalization() {
    let embedder = HashEmbedder::with_dimension(256);
    let vector = embedder.embed("some text to embed", EmbedMode::Document).await.unwrap();
    assert_eq!(vector.len(), 256);

    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5, "expected unit norm, got {}", norm);
  }

  #[tokio::test]
  async fn test_distinct_texts_differ() {
    let embedder = HashEmbedder::with_dimension(128);
    let a = embedder.embed("espresso", EmbedMode::Document).await.unwrap();
    let b = embedder.embed("network protocols", EmbedMode::Document).await.unwrap();
    assert_ne!(a, b);
  }

  #[tokio::test]
  async fn test_empty_text_is_zero_vector() {
    let embedder = HashEmbedder::with_dimension(64);
    let vector = embedder.embed("", EmbedMode::Document).await.unwrap();
    assert!(vector.iter().all(|v| *v == 0.0));
  }

  #[tokio::test]
  async fn test_batch_matches_single() {
    let embedder = HashEmbedder::with_dimension(64);
    let single = embedder.embed("alpha", EmbedMode::Document).await.unwrap();
    let batch = embedder.embed_batch(&["alpha", "beta"], EmbedMode::Document).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0], single);
  }
}
