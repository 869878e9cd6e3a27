//! Streaming content hashing for change detection.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Read buffer size for streaming hashes.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 over the raw bytes of a file, read in 64 KiB chunks.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
  let mut file = tokio::fs::File::open(path).await?;
  let mut hasher = Sha256::new();
  let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

  loop {
    let read = file.read(&mut buffer).await?;
    if read == 0 {
      break;
    }
    hasher.update(&buffer[..read]);
  }

  Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over in-memory content. Matches [`hash_file`] byte for byte.
pub fn hash_bytes(content: &[u8]) -> String {
  hex::encode(Sha256::digest(content))
}
