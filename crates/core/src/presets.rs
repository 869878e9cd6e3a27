//! File-type presets: named sets of glob patterns for filtering.
//!
//! The registry is closed at build time; unknown names produce a single
//! error listing every valid preset.

use thiserror::Error;

/// The fixed preset registry, in display order.
const PRESETS: &[(&str, &[&str])] = &[
  ("python", &["*.py", "*.pyi"]),
  ("javascript", &["*.js", "*.mjs", "*.cjs", "*.jsx"]),
  ("typescript", &["*.ts", "*.mts", "*.cts", "*.tsx"]),
  ("go", &["*.go"]),
  ("rust", &["*.rs"]),
  ("java", &["*.java"]),
  ("csharp", &["*.cs"]),
  ("c", &["*.c", "*.h"]),
  ("cpp", &["*.cpp", "*.cc", "*.cxx", "*.hpp", "*.hh"]),
  ("web", &["*.html", "*.css", "*.scss", "*.vue", "*.svelte"]),
  ("docs", &["*.md", "*.markdown", "*.rst", "*.txt", "*.adoc", "*.org"]),
  (
    "code",
    &[
      "*.py", "*.pyi", "*.js", "*.mjs", "*.cjs", "*.jsx", "*.ts", "*.mts", "*.cts", "*.tsx", "*.go", "*.rs", "*.java",
      "*.cs", "*.c", "*.h", "*.cpp", "*.cc", "*.cxx", "*.hpp", "*.hh",
    ],
  ),
  ("text", &["*.txt", "*.text"]),
  ("pdf", &["*.pdf"]),
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PresetError {
  #[error("unknown file-type preset(s) {unknown:?}; valid presets are: {valid}")]
  Unknown { unknown: Vec<String>, valid: String },
}

/// Names of all registered presets, in registry order.
pub fn preset_names() -> Vec<&'static str> {
  PRESETS.iter().map(|(name, _)| *name).collect()
}

/// Look up the glob patterns for one preset.
pub fn preset_patterns(name: &str) -> Option<&'static [&'static str]> {
  PRESETS.iter().find(|(n, _)| *n == name).map(|(_, patterns)| *patterns)
}

/// Resolve an ordered list of preset names to a deduplicated, ordered
/// list of glob patterns (order of first occurrence).
///
/// All names are validated before any expansion: if any are unknown the
/// result is a single error naming every valid preset.
pub fn resolve_presets(names: &[String]) -> Result<Vec<String>, PresetError> {
  let unknown: Vec<String> = names
    .iter()
    .filter(|name| preset_patterns(name).is_none())
    .cloned()
    .collect();

  if !unknown.is_empty() {
    return Err(PresetError::Unknown {
      unknown,
      valid: preset_names().join(", "),
    });
  }

  let mut patterns = Vec::new();
  for name in names {
    for pattern in preset_patterns(name).unwrap_or(&[]) {
      if !patterns.iter().any(|p| p == pattern) {
        patterns.push((*pattern).to_string());
      }
    }
  }
  Ok(patterns)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_single_preset() {
    let patterns = resolve_presets(&["rust".to_string()]).unwrap();
    assert_eq!(patterns, vec!["*.rs".to_string()]);
  }

  #[test]
  fn test_resolve_dedups_preserving_first_occurrence() {
    let repeated = resolve_presets(&["python".into(), "docs".into(), "python".into()]).unwrap();
    let once = resolve_presets(&["python".into(), "docs".into()]).unwrap();
    assert_eq!(repeated, once);
    assert_eq!(repeated[0], "*.py");
  }

  #[test]
  fn test_overlapping_presets_dedup() {
    // "code" already includes *.rs; "rust" adds nothing new.
    let patterns = resolve_presets(&["code".into(), "rust".into()]).unwrap();
    assert_eq!(patterns.iter().filter(|p| p.as_str() == "*.rs").count(), 1);
  }

  #[test]
  fn test_unknown_preset_lists_all_valid_names() {
    let err = resolve_presets(&["python".into(), "bogus".into()]).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("bogus"));
    for name in preset_names() {
      assert!(message.contains(name), "error should list {}", name);
    }
  }

  #[test]
  fn test_empty_input_resolves_to_empty() {
    assert!(resolve_presets(&[]).unwrap().is_empty());
  }
}
