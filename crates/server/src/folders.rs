//! Folder manifest persistence.
//!
//! The manifest is a line-delimited JSON file (`indexed_folders.jsonl`)
//! in the state directory: one line per indexed folder. Every mutation
//! is a full rewrite through a temp file and an atomic rename, serialized
//! by a single in-process lock. Multi-process safety is explicitly not
//! promised.

use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use recall_core::types::FolderRecord;

use crate::error::Result;

pub const MANIFEST_FILE: &str = "indexed_folders.jsonl";

pub struct FolderManager {
  manifest_path: PathBuf,
  records: Mutex<Vec<FolderRecord>>,
}

impl FolderManager {
  /// Load the manifest from the state directory, creating nothing yet.
  /// Unparseable lines are skipped with a warning rather than poisoning
  /// the whole manifest.
  pub async fn load(state_dir: &std::path::Path) -> Result<Self> {
    let manifest_path = state_dir.join(MANIFEST_FILE);
    let mut records = Vec::new();

    match tokio::fs::read_to_string(&manifest_path).await {
      Ok(content) => {
        for (number, line) in content.lines().enumerate() {
          if line.trim().is_empty() {
            continue;
          }
          match serde_json::from_str::<FolderRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = number + 1, err = %e, "Skipping malformed manifest line"),
          }
        }
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(e.into()),
    }

    debug!(folders = records.len(), path = %manifest_path.display(), "Folder manifest loaded");
    Ok(Self {
      manifest_path,
      records: Mutex::new(records),
    })
  }

  /// Insert or replace the record for a canonical folder path.
  pub async fn add_folder(&self, record: FolderRecord) -> Result<()> {
    let mut records = self.records.lock().await;
    if let Some(existing) = records.iter_mut().find(|r| r.path == record.path) {
      *existing = record;
    } else {
      records.push(record);
    }
    self.persist(&records).await
  }

  pub async fn list_folders(&self) -> Vec<FolderRecord> {
    self.records.lock().await.clone()
  }

  /// Look up a record by canonical path.
  pub async fn get_folder(&self, canonical_path: &str) -> Option<FolderRecord> {
    self.records.lock().await.iter().find(|r| r.path == canonical_path).cloned()
  }

  /// Remove and return the record for a canonical path. The caller is
  /// responsible for deleting the folder's chunks from storage first.
  pub async fn remove_record(&self, canonical_path: &str) -> Result<Option<FolderRecord>> {
    let mut records = self.records.lock().await;
    let position = records.iter().position(|r| r.path == canonical_path);
    let Some(position) = position else {
      return Ok(None);
    };
    let removed = records.remove(position);
    self.persist(&records).await?;
    Ok(Some(removed))
  }

  /// Full rewrite via temp file + atomic rename. Called with the record
  /// lock held so concurrent mutators serialize.
  async fn persist(&self, records: &[FolderRecord]) -> Result<()> {
    if let Some(parent) = self.manifest_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let mut content = String::new();
    for record in records {
      content.push_str(&serde_json::to_string(record)?);
      content.push('\n');
    }

    let temp_path = self.manifest_path.with_extension("jsonl.tmp");
    tokio::fs::write(&temp_path, content).await?;
    tokio::fs::rename(&temp_path, &self.manifest_path).await?;
    Ok(())
  }
}
