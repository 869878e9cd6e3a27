//! Configuration system for Recall.
//!
//! Configuration is expressed as typed option structs with enumerated
//! recognized keys. Unknown keys produce warnings in normal mode and are
//! fatal under `strict_mode`. Discovery order: explicit env override >
//! state directory > CWD > walk-up to a project marker > user home >
//! XDG config directory. First hit wins.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::failure::Failure;
use crate::paths;

/// Environment variable naming an explicit config file path.
pub const CONFIG_ENV: &str = "RECALL_CONFIG";
/// Environment variable overriding the relational connection parameters.
pub const DATABASE_URL_ENV: &str = "RECALL_DATABASE_URL";
/// Config file name searched for in each discovery location.
pub const CONFIG_FILE_NAME: &str = "recall.toml";

// ============================================================================
// Storage Configuration
// ============================================================================

/// Which storage implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  #[default]
  Embedded,
  Relational,
}

impl BackendKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      BackendKind::Embedded => "embedded",
      BackendKind::Relational => "relational",
    }
  }
}

/// Distance metric used for vector similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
  #[default]
  Cosine,
  L2,
  InnerProduct,
}

/// Text-search language for the relational backend's weighted column.
///
/// Closed set mirroring the regconfig names the backend ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextSearchLanguage {
  #[default]
  English,
  Spanish,
  French,
  German,
  Italian,
  Portuguese,
  Russian,
  Simple,
}

impl TextSearchLanguage {
  /// The regconfig name. Values come from this closed enum, so the name
  /// is safe to splice into SQL.
  pub fn as_str(&self) -> &'static str {
    match self {
      TextSearchLanguage::English => "english",
      TextSearchLanguage::Spanish => "spanish",
      TextSearchLanguage::French => "french",
      TextSearchLanguage::German => "german",
      TextSearchLanguage::Italian => "italian",
      TextSearchLanguage::Portuguese => "portuguese",
      TextSearchLanguage::Russian => "russian",
      TextSearchLanguage::Simple => "simple",
    }
  }
}

/// Relational backend connection and schema settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
  pub host: String,
  pub port: u16,
  pub database: String,
  pub user: String,
  pub password: String,

  /// Base connection pool size (default: 10)
  pub pool_size: usize,
  /// Additional connections allowed beyond the base pool (default: 10)
  pub pool_max_overflow: usize,

  /// Language for the weighted text-search column (default: english)
  pub language: TextSearchLanguage,

  /// HNSW index build parameters
  pub hnsw_m: usize,
  pub hnsw_ef_construction: usize,
}

impl Default for RelationalConfig {
  fn default() -> Self {
    Self {
      host: "localhost".to_string(),
      port: 5432,
      database: "recall".to_string(),
      user: "recall".to_string(),
      password: String::new(),
      pool_size: 10,
      pool_max_overflow: 10,
      language: TextSearchLanguage::English,
      hnsw_m: 16,
      hnsw_ef_construction: 64,
    }
  }
}

impl RelationalConfig {
  /// Connection URL, honoring the `RECALL_DATABASE_URL` override.
  /// Pool sizing is unaffected by the override.
  pub fn connection_url(&self) -> String {
    if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
      return url;
    }
    format!(
      "postgres://{}:{}@{}:{}/{}",
      self.user, self.password, self.host, self.port, self.database
    )
  }

  /// Total connections the pool may open.
  pub fn max_pool_size(&self) -> usize {
    self.pool_size + self.pool_max_overflow
  }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
  /// Which backend to use (default: embedded)
  pub backend: BackendKind,

  /// Distance metric for vector similarity (default: cosine)
  pub distance: DistanceMetric,

  /// Relational backend settings (only used when backend = relational)
  pub relational: RelationalConfig,
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Embedding provider options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
  /// Deterministic local feature-hashing embedder; no network required.
  #[default]
  Offline,
  Ollama,
  OpenAi,
}

/// Embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  /// Which embedding provider to use
  pub provider: EmbeddingProviderKind,

  /// Model name (e.g., "nomic-embed-text", "text-embedding-3-small")
  pub model: String,

  /// Embedding dimension (must match the model output)
  pub dimension: usize,

  /// Provider base URL
  pub base_url: String,

  /// Environment variable holding the API key (cloud providers only)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub api_key_env: Option<String>,

  /// Texts per embedding request (default: 100)
  pub batch_size: usize,

  /// Per-batch request timeout in seconds (default: 30)
  pub timeout_secs: u64,

  /// Optional task instruction prepended to queries for
  /// instruction-following embedding models.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub query_instruction: Option<String>,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      provider: EmbeddingProviderKind::Offline,
      model: "hash-trigram".to_string(),
      dimension: 768,
      base_url: "http://localhost:11434".to_string(),
      api_key_env: None,
      batch_size: 100,
      timeout_secs: 30,
      query_instruction: None,
    }
  }
}

/// Summarization provider options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompletionProviderKind {
  #[default]
  Ollama,
  OpenAi,
}

/// Chunk enrichment (summarization) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
  /// Enable per-chunk summaries during indexing (default: false)
  pub enabled: bool,

  pub provider: CompletionProviderKind,
  pub model: String,
  pub base_url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub api_key_env: Option<String>,

  /// Per-call timeout in seconds; timeouts are fail-open (default: 10)
  pub timeout_secs: u64,

  /// Maximum summary length in characters (default: 280)
  pub max_chars: usize,
}

impl Default for SummarizationConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      provider: CompletionProviderKind::Ollama,
      model: "llama3.2".to_string(),
      base_url: "http://localhost:11434".to_string(),
      api_key_env: None,
      timeout_secs: 10,
      max_chars: 280,
    }
  }
}

/// Reranker provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
  pub model: String,
  pub base_url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub api_key_env: Option<String>,

  /// Per-call timeout in seconds; timeouts are fail-open (default: 10)
  pub timeout_secs: u64,
}

impl Default for RerankerConfig {
  fn default() -> Self {
    Self {
      model: "rerank-lite".to_string(),
      base_url: "http://localhost:8787".to_string(),
      api_key_env: None,
      timeout_secs: 10,
    }
  }
}

/// Two-stage reranking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankingConfig {
  /// Enable two-stage reranking (default: false)
  pub enabled: bool,

  /// Stage-1 candidate multiplier (default: 10)
  pub multiplier: usize,

  /// Hard cap on stage-1 candidates (default: 100)
  pub max_candidates: usize,
}

impl Default for RerankingConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      multiplier: 10,
      max_candidates: 100,
    }
  }
}

// ============================================================================
// Query Configuration
// ============================================================================

/// Query engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// Default number of results (default: 10)
  pub default_top_k: usize,

  /// Hybrid fusion weights (default: 0.5 each)
  pub vector_weight: f32,
  pub keyword_weight: f32,

  /// Minimum similarity for vector results (default: 0.0)
  pub similarity_threshold: f32,

  /// Multi-mode: per-signal fetch multiplier M (default: 3)
  pub multi_fetch_multiplier: usize,

  /// Multi-mode per-signal fusion weights
  pub multi_keyword_weight: f32,
  pub multi_vector_weight: f32,
  pub multi_hybrid_weight: f32,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      default_top_k: 10,
      vector_weight: 0.5,
      keyword_weight: 0.5,
      similarity_threshold: 0.0,
      multi_fetch_multiplier: 3,
      multi_keyword_weight: 1.0,
      multi_vector_weight: 1.0,
      multi_hybrid_weight: 1.0,
    }
  }
}

// ============================================================================
// Indexing Configuration
// ============================================================================

/// Indexing pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
  /// Target chunk size for documents, in estimated tokens (default: 512)
  pub doc_target_tokens: usize,

  /// Overlap between adjacent document chunks, in tokens (default: 50)
  pub doc_overlap_tokens: usize,

  /// Maximum file size to index in bytes (default: 1MB)
  pub max_file_size: u64,

  /// Completed job records to retain, oldest pruned first (default: 200)
  pub job_retention: usize,
}

impl Default for IndexConfig {
  fn default() -> Self {
    Self {
      doc_target_tokens: 512,
      doc_overlap_tokens: 50,
      max_file_size: 1024 * 1024,
      job_retention: 200,
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Recall configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Abort startup on any configuration warning (default: false)
  pub strict_mode: bool,

  pub storage: StorageConfig,
  pub embedding: EmbeddingConfig,
  pub summarization: SummarizationConfig,
  pub reranker: RerankerConfig,
  pub reranking: RerankingConfig,
  pub query: QueryConfig,
  pub index: IndexConfig,
}

/// A non-fatal configuration problem. Promoted to a Configuration
/// failure under `strict_mode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning(pub String);

impl std::fmt::Display for ConfigWarning {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl Config {
  /// Parse TOML content, collecting unknown-key warnings.
  pub fn load_str(content: &str) -> Result<(Self, Vec<ConfigWarning>), Failure> {
    let value: toml::Value = content
      .parse()
      .map_err(|e| Failure::configuration(format!("invalid config file: {}", e)))?;

    let mut warnings = unknown_key_warnings(&value);

    let config: Config =
      toml::from_str(content).map_err(|e| Failure::configuration(format!("invalid config file: {}", e)))?;

    warnings.extend(config.validate());
    Ok((config, warnings))
  }

  /// Load from an explicit file path.
  pub fn load_file(path: &Path) -> Result<(Self, Vec<ConfigWarning>), Failure> {
    let content = std::fs::read_to_string(path)
      .map_err(|e| Failure::configuration(format!("cannot read config file {}: {}", path.display(), e)))?;
    Self::load_str(&content)
  }

  /// Discover and load configuration.
  ///
  /// Search order, first hit wins:
  /// 1. `RECALL_CONFIG` env var (explicit path)
  /// 2. state directory
  /// 3. `cwd`
  /// 4. walk-up from `cwd` to the first directory containing `.git`
  /// 5. user home directory
  /// 6. XDG config directory
  ///
  /// Returns defaults (with no warnings) when nothing is found.
  pub fn discover(cwd: &Path) -> Result<(Self, Vec<ConfigWarning>), Failure> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
      return Self::load_file(Path::new(&explicit));
    }

    for candidate in Self::discovery_paths(cwd) {
      if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "Loading discovered config");
        return Self::load_file(&candidate);
      }
    }

    Ok((Self::default(), Vec::new()))
  }

  /// The discovery candidates in order (excluding the env override).
  pub fn discovery_paths(cwd: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![
      paths::default_state_dir().join(CONFIG_FILE_NAME),
      cwd.join(CONFIG_FILE_NAME),
    ];

    // Walk up to the nearest project marker.
    let mut dir = cwd.parent();
    while let Some(current) = dir {
      if current.join(".git").exists() {
        candidates.push(current.join(CONFIG_FILE_NAME));
        break;
      }
      dir = current.parent();
    }

    if let Some(home) = dirs::home_dir() {
      candidates.push(home.join(CONFIG_FILE_NAME));
    }
    candidates.push(paths::default_config_dir().join(CONFIG_FILE_NAME));

    candidates
  }

  /// Semantic validation, producing warnings for fixable problems.
  pub fn validate(&self) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if self.embedding.dimension == 0 {
      warnings.push(ConfigWarning("embedding.dimension must be greater than zero".into()));
    }
    if self.embedding.batch_size == 0 {
      warnings.push(ConfigWarning("embedding.batch_size must be greater than zero".into()));
    }

    if self.embedding.provider == EmbeddingProviderKind::OpenAi {
      match self.embedding.api_key_env.as_deref() {
        Some(env) if std::env::var(env).is_ok() => {}
        Some(env) => warnings.push(ConfigWarning(format!(
          "embedding.api_key_env names {env} but it is not set in the environment"
        ))),
        None => warnings.push(ConfigWarning(
          "embedding.provider = \"openai\" requires embedding.api_key_env".into(),
        )),
      }
    }

    if self.reranking.enabled && self.reranking.multiplier == 0 {
      warnings.push(ConfigWarning("reranking.multiplier must be greater than zero".into()));
    }

    if self.query.vector_weight < 0.0 || self.query.keyword_weight < 0.0 {
      warnings.push(ConfigWarning("query fusion weights must be non-negative".into()));
    }

    warnings
  }

  /// Generate a commented default config file.
  pub fn template() -> String {
    r#"# Recall Configuration
# Searched for as recall.toml in: $RECALL_CONFIG (explicit path), the
# state directory, the working directory, the enclosing repository root,
# your home directory, and the XDG config directory. First hit wins.

# Abort startup on any configuration warning.
strict_mode = false

# ============================================================================
# Storage
# ============================================================================

[storage]
# Backend: embedded (local vector store) or relational (Postgres + pgvector).
# Switching backends requires an explicit re-index; there is no migration.
backend = "embedded"

# Distance metric: cosine, l2, or inner_product
distance = "cosine"

[storage.relational]
# Connection parameters. RECALL_DATABASE_URL overrides all five; pool
# sizing is unaffected by the override.
host = "localhost"
port = 5432
database = "recall"
user = "recall"
password = ""

# Connection pool: base size plus allowed overflow
pool_size = 10
pool_max_overflow = 10

# Text-search language: english, spanish, french, german, italian,
# portuguese, russian, or simple
language = "english"

# HNSW index build parameters
hnsw_m = 16
hnsw_ef_construction = 64

# ============================================================================
# Embedding
# ============================================================================

[embedding]
# Provider: offline (deterministic, no network), ollama, or openai
provider = "offline"
model = "hash-trigram"

# WARNING: changing the dimension after indexing requires reset + re-index.
dimension = 768

# Provider base URL (ollama / openai-compatible endpoints)
base_url = "http://localhost:11434"

# Environment variable holding the API key (cloud providers)
# api_key_env = "OPENAI_API_KEY"

# Texts per embedding request
batch_size = 100

# Per-batch timeout in seconds (retried up to 3 times with backoff)
timeout_secs = 30

# Task instruction prepended to queries for instruction-tuned models
# query_instruction = "Given a question, retrieve relevant passages"

# ============================================================================
# Enrichment (chunk summaries)
# ============================================================================

[summarization]
enabled = false
provider = "ollama"
model = "llama3.2"
base_url = "http://localhost:11434"
# api_key_env = "OPENAI_API_KEY"

# Per-call timeout in seconds; failures and timeouts are fail-open
timeout_secs = 10

# Maximum summary length in characters
max_chars = 280

# ============================================================================
# Reranking
# ============================================================================

[reranker]
model = "rerank-lite"
base_url = "http://localhost:8787"
# api_key_env = "RERANK_API_KEY"
timeout_secs = 10

[reranking]
# Two-stage reranking: retrieve top_k x multiplier candidates, then
# re-order with the reranker. Reranker failures are fail-open.
enabled = false
multiplier = 10
max_candidates = 100

# ============================================================================
# Query
# ============================================================================

[query]
default_top_k = 10

# Hybrid fusion weights
vector_weight = 0.5
keyword_weight = 0.5

# Minimum similarity for vector results
similarity_threshold = 0.0

# Multi mode: per-signal fetch multiplier and fusion weights
multi_fetch_multiplier = 3
multi_keyword_weight = 1.0
multi_vector_weight = 1.0
multi_hybrid_weight = 1.0

# ============================================================================
# Indexing
# ============================================================================

[index]
# Document chunking: target size and overlap, in estimated tokens
doc_target_tokens = 512
doc_overlap_tokens = 50

# Maximum file size to index (bytes)
max_file_size = 1048576

# Completed job records to retain (oldest pruned first)
job_retention = 200
"#
    .to_string()
  }

  /// Promote warnings according to `strict_mode`: log in normal mode,
  /// fail in strict mode.
  pub fn enforce(&self, warnings: &[ConfigWarning]) -> Result<(), Failure> {
    if warnings.is_empty() {
      return Ok(());
    }
    if self.strict_mode {
      return Err(
        Failure::configuration(format!(
          "strict_mode: {} configuration warning(s): {}",
          warnings.len(),
          warnings
            .iter()
            .map(|w| w.0.clone())
            .collect::<Vec<_>>()
            .join("; ")
        ))
        .with_hint("fix the listed settings or disable strict_mode"),
      );
    }
    for warning in warnings {
      tracing::warn!(warning = %warning, "Configuration warning");
    }
    Ok(())
  }
}

/// Recognized top-level and per-section keys for unknown-key detection.
fn recognized_keys() -> Vec<(&'static str, &'static [&'static str])> {
  vec![
    (
      "",
      &[
        "strict_mode",
        "storage",
        "embedding",
        "summarization",
        "reranker",
        "reranking",
        "query",
        "index",
      ],
    ),
    ("storage", &["backend", "distance", "relational"]),
    (
      "storage.relational",
      &[
        "host",
        "port",
        "database",
        "user",
        "password",
        "pool_size",
        "pool_max_overflow",
        "language",
        "hnsw_m",
        "hnsw_ef_construction",
      ],
    ),
    (
      "embedding",
      &[
        "provider",
        "model",
        "dimension",
        "base_url",
        "api_key_env",
        "batch_size",
        "timeout_secs",
        "query_instruction",
      ],
    ),
    (
      "summarization",
      &[
        "enabled",
        "provider",
        "model",
        "base_url",
        "api_key_env",
        "timeout_secs",
        "max_chars",
      ],
    ),
    ("reranker", &["model", "base_url", "api_key_env", "timeout_secs"]),
    ("reranking", &["enabled", "multiplier", "max_candidates"]),
    (
      "query",
      &[
        "default_top_k",
        "vector_weight",
        "keyword_weight",
        "similarity_threshold",
        "multi_fetch_multiplier",
        "multi_keyword_weight",
        "multi_vector_weight",
        "multi_hybrid_weight",
      ],
    ),
    (
      "index",
      &["doc_target_tokens", "doc_overlap_tokens", "max_file_size", "job_retention"],
    ),
  ]
}

/// Diff parsed tables against the recognized key sets.
fn unknown_key_warnings(value: &toml::Value) -> Vec<ConfigWarning> {
  let mut warnings = Vec::new();

  for (section, keys) in recognized_keys() {
    let table = if section.is_empty() {
      value.as_table()
    } else {
      let mut current = Some(value);
      for part in section.split('.') {
        current = current.and_then(|v| v.get(part));
      }
      current.and_then(|v| v.as_table())
    };

    let Some(table) = table else { continue };
    let known: BTreeSet<&str> = keys.iter().copied().collect();
    for key in table.keys() {
      if !known.contains(key.as_str()) {
        let path = if section.is_empty() {
          key.clone()
        } else {
          format!("{}.{}", section, key)
        };
        warnings.push(ConfigWarning(format!("unrecognized configuration key: {}", path)));
      }
    }
  }

  warnings
}
