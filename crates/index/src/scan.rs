//! Folder scanning with gitignore-aware filtering.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use tracing::{debug, warn};

use recall_core::types::SourceType;

use crate::language::{Language, classify};
use crate::pipeline::IndexError;

/// Patterns excluded from every scan, on top of gitignore rules.
const GLOBAL_EXCLUDES: &[&str] = &[
  "node_modules/",
  "target/",
  "dist/",
  "build/",
  "vendor/",
  ".venv/",
  "venv/",
  "__pycache__/",
  "*.min.js",
  "*.min.css",
  "*.map",
  "*.lock",
  "package-lock.json",
];

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
  pub recursive: bool,
  /// Whitelist globs; when non-empty, only matching files are scanned.
  pub include_patterns: Vec<String>,
  /// Blacklist globs applied after includes.
  pub exclude_patterns: Vec<String>,
  /// Files larger than this are skipped with a warning. 0 disables.
  pub max_file_size: u64,
}

#[derive(Debug, Clone)]
pub struct ScannedFile {
  /// Canonical absolute path.
  pub path: PathBuf,
  pub source_type: SourceType,
  pub language: Option<Language>,
  pub size: u64,
}

/// Walk `root` applying gitignore rules, the global exclude set, and the
/// caller's include/exclude globs. Results are sorted by path so scans
/// are deterministic.
pub fn scan_folder(root: &Path, options: &ScanOptions) -> Result<Vec<ScannedFile>, IndexError> {
  let mut overrides = OverrideBuilder::new(root);
  for pattern in &options.include_patterns {
    overrides
      .add(pattern)
      .map_err(|e| IndexError::InvalidInput(format!("bad include pattern {:?}: {}", pattern, e)))?;
  }
  for pattern in &options.exclude_patterns {
    overrides
      .add(&format!("!{}", pattern))
      .map_err(|e| IndexError::InvalidInput(format!("bad exclude pattern {:?}: {}", pattern, e)))?;
  }
  for pattern in GLOBAL_EXCLUDES {
    overrides
      .add(&format!("!{}", pattern))
      .map_err(|e| IndexError::InvalidInput(format!("bad global exclude {:?}: {}", pattern, e)))?;
  }
  let overrides = overrides
    .build()
    .map_err(|e| IndexError::InvalidInput(format!("cannot compile scan patterns: {}", e)))?;

  let mut builder = WalkBuilder::new(root);
  builder
    .hidden(true)
    .git_ignore(true)
    .git_global(false)
    .git_exclude(true)
    .overrides(overrides);
  if !options.recursive {
    builder.max_depth(Some(1));
  }

  let mut files = Vec::new();
  for entry in builder.build() {
    let entry = match entry {
      Ok(entry) => entry,
      Err(e) => {
        warn!(err = %e, "Skipping unreadable entry during scan");
        continue;
      }
    };

    if !entry.file_type().is_some_and(|t| t.is_file()) {
      continue;
    }

    let path = entry.path();
    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
    if options.max_file_size > 0 && size > options.max_file_size {
      warn!(path = %path.display(), size, limit = options.max_file_size, "Skipping oversized file");
      continue;
    }

    let extension = path.extension().and_then(|e| e.to_str());
    let (source_type, language) = classify(extension);

    files.push(ScannedFile {
      path: path.to_path_buf(),
      source_type,
      language,
      size,
    });
  }

  files.sort_by(|a, b| a.path.cmp(&b.path));
  debug!(root = %root.display(), files = files.len(), "Scan complete");
  Ok(files)
}
