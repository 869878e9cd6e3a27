//! Chunk and search-result data model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Whether a chunk came from a document or a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
  Doc,
  Code,
}

impl SourceType {
  pub fn as_str(&self) -> &'static str {
    match self {
      SourceType::Doc => "doc",
      SourceType::Code => "code",
    }
  }
}

impl std::str::FromStr for SourceType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "doc" => Ok(SourceType::Doc),
      "code" => Ok(SourceType::Code),
      other => Err(format!("unknown source type: {}", other)),
    }
  }
}

/// Metadata attached to every chunk.
///
/// `source` is always the canonical absolute path of the originating file.
/// `extra` holds additional scalar values; backends persist the whole
/// mapping as flat key/value attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
  pub source: String,
  pub file_name: String,
  pub source_type: SourceType,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub language: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub summary: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub extra: BTreeMap<String, String>,
}

impl ChunkMetadata {
  pub fn new(source: impl Into<String>, file_name: impl Into<String>, source_type: SourceType) -> Self {
    Self {
      source: source.into(),
      file_name: file_name.into(),
      source_type,
      language: None,
      summary: None,
      extra: BTreeMap::new(),
    }
  }

  /// Flatten into a key/value mapping for backends that store metadata as
  /// attached attributes.
  pub fn to_map(&self) -> BTreeMap<String, String> {
    let mut map = self.extra.clone();
    map.insert("source".into(), self.source.clone());
    map.insert("file_name".into(), self.file_name.clone());
    map.insert("source_type".into(), self.source_type.as_str().into());
    if let Some(ref language) = self.language {
      map.insert("language".into(), language.clone());
    }
    if let Some(ref summary) = self.summary {
      map.insert("summary".into(), summary.clone());
    }
    map
  }

  /// Rebuild from a flat mapping. Unknown keys land in `extra`.
  pub fn from_map(mut map: BTreeMap<String, String>) -> Self {
    let source = map.remove("source").unwrap_or_default();
    let file_name = map.remove("file_name").unwrap_or_default();
    let source_type = map
      .remove("source_type")
      .and_then(|s| s.parse().ok())
      .unwrap_or(SourceType::Doc);
    let language = map.remove("language");
    let summary = map.remove("summary");
    Self {
      source,
      file_name,
      source_type,
      language,
      summary,
      extra: map,
    }
  }
}

/// The atomic unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
  pub id: String,
  pub text: String,
  pub metadata: ChunkMetadata,
}

/// Result of any query mode. `score` is always in [0, 1], higher is
/// better, regardless of backend or mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
  pub chunk_id: String,
  pub text: String,
  pub metadata: ChunkMetadata,
  pub score: f32,
  /// Score assigned by the reranker when two-stage reranking ran.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rerank_score: Option<f32>,
  /// 1-indexed position before reranking.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub original_rank: Option<usize>,
}

/// Process-wide record binding the store to one embedding model.
///
/// Written on the first successful index operation; once set, a differing
/// dimension at startup is fatal unless the caller explicitly resets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
  pub provider: String,
  pub model: String,
  pub dimension: usize,
}

/// Per-file record inside a folder manifest entry. Lets partial
/// re-indexes identify stale chunks without touching the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
  /// Canonical absolute path of the file.
  pub path: String,
  /// SHA-256 of the raw file bytes.
  pub content_hash: String,
  /// Chunk ids produced from this file, in chunk order.
  pub chunk_ids: Vec<String>,
}

/// Durable record of one indexed folder.
///
/// Folders own their chunk ids; removal walks folder -> ids -> storage
/// delete. The union of `chunk_ids` across records is a subset of the
/// chunks in the store, except during a recoverable failure window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderRecord {
  /// Canonical folder path (the only folder identity key).
  pub path: String,
  /// UTC timestamp of the last successful index.
  pub last_indexed: chrono::DateTime<chrono::Utc>,
  pub chunk_count: usize,
  /// Ordered chunk ids owned by this folder.
  pub chunk_ids: Vec<String>,
  /// Per-file records for change detection.
  pub files: Vec<FileRecord>,
}

impl FolderRecord {
  /// Look up the record for a file by canonical path.
  pub fn file(&self, path: &str) -> Option<&FileRecord> {
    self.files.iter().find(|f| f.path == path)
  }
}

/// Deterministic chunk identifier: SHA-256 over source path, chunk index,
/// and body, truncated to 32 hex chars. Stable across re-indexes of
/// unchanged content.
pub fn compute_chunk_id(source: &str, index: usize, body: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(source.as_bytes());
  hasher.update(b"\n");
  hasher.update(index.to_string().as_bytes());
  hasher.update(b"\n");
  hasher.update(body.as_bytes());
  let digest = hasher.finalize();
  hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_chunk_id_deterministic() {
    let a = compute_chunk_id("/docs/guide.md", 0, "espresso brewing guide");
    let b = compute_chunk_id("/docs/guide.md", 0, "espresso brewing guide");
    assert_eq!(a, b);
    assert_eq!(a.len(), 32);
  }

  #[test]
  fn test_chunk_id_varies_by_inputs() {
    let base = compute_chunk_id("/a.md", 0, "body");
    assert_ne!(base, compute_chunk_id("/b.md", 0, "body"));
    assert_ne!(base, compute_chunk_id("/a.md", 1, "body"));
    assert_ne!(base, compute_chunk_id("/a.md", 0, "other"));
  }

  #[test]
  fn test_metadata_map_round_trip() {
    let mut metadata = ChunkMetadata::new("/src/lib.rs", "lib.rs", SourceType::Code);
    metadata.language = Some("rust".into());
    metadata.extra.insert("chunk_index".into(), "3".into());

    let map = metadata.to_map();
    assert_eq!(map.get("source_type").map(String::as_str), Some("code"));

    let back = ChunkMetadata::from_map(map);
    assert_eq!(back, metadata);
  }

  #[test]
  fn test_metadata_map_omits_unset_fields() {
    let metadata = ChunkMetadata::new("/docs/a.md", "a.md", SourceType::Doc);
    let map = metadata.to_map();
    assert!(!map.contains_key("language"));
    assert!(!map.contains_key("summary"));
  }
}
