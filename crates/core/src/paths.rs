//! Path canonicalization and state directories.

use std::path::{Path, PathBuf};

/// Canonicalize a folder path for use as a folder identity key.
///
/// The result is absolute with symlinks resolved, and case-normalized on
/// platforms whose default filesystems are case-insensitive. This is the
/// only key used for folder identity: two spellings of the same folder
/// always canonicalize identically.
pub fn canonical_folder(path: &Path) -> std::io::Result<PathBuf> {
  let resolved = std::fs::canonicalize(path)?;

  #[cfg(any(target_os = "macos", target_os = "windows"))]
  {
    Ok(PathBuf::from(resolved.to_string_lossy().to_lowercase()))
  }

  #[cfg(not(any(target_os = "macos", target_os = "windows")))]
  {
    Ok(resolved)
  }
}

/// Default base directory for Recall state (store, manifest, jobs).
///
/// Respects, in order of precedence:
/// 1. `RECALL_DATA_DIR` - explicit override
/// 2. `XDG_DATA_HOME` - standard XDG data home
/// 3. platform data dir
pub fn default_state_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("RECALL_DATA_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg_data).join("recall");
  }

  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("recall")
}

/// Default config directory.
///
/// Respects `RECALL_CONFIG_DIR`, then `XDG_CONFIG_HOME`, then the
/// platform config dir.
pub fn default_config_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("RECALL_CONFIG_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
    return PathBuf::from(xdg_config).join("recall");
  }

  dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("recall")
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  #[test]
  fn test_canonical_folder_is_absolute() {
    let temp = TempDir::new().unwrap();
    let canonical = canonical_folder(temp.path()).unwrap();
    assert!(canonical.is_absolute());
  }

  #[test]
  fn test_canonical_folder_resolves_dot_segments() {
    let temp = TempDir::new().unwrap();
    let nested = temp.path().join("sub");
    std::fs::create_dir(&nested).unwrap();

    let with_dots = temp.path().join("sub").join("..").join("sub");
    assert_eq!(canonical_folder(&with_dots).unwrap(), canonical_folder(&nested).unwrap());
  }

  #[cfg(unix)]
  #[test]
  fn test_canonical_folder_resolves_symlinks() {
    let temp = TempDir::new().unwrap();
    let real = temp.path().join("real");
    std::fs::create_dir(&real).unwrap();
    let link = temp.path().join("link");
    std::os::unix::fs::symlink(&real, &link).unwrap();

    assert_eq!(canonical_folder(&link).unwrap(), canonical_folder(&real).unwrap());
  }

  #[test]
  fn test_canonical_folder_missing_path_errors() {
    assert!(canonical_folder(Path::new("/definitely/not/a/real/path/xyz")).is_err());
  }
}
