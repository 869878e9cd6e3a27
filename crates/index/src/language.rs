//! File classification: documents vs code, and code language detection.

use recall_core::types::SourceType;

/// File extensions treated as documents rather than code.
const DOCUMENT_EXTENSIONS: &[&str] = &[
  "md", "markdown", "txt", "text", "rst", "adoc", "asciidoc", "org", "wiki", "textile",
];

/// Check if a file extension indicates a document file.
pub fn is_document_extension(ext: &str) -> bool {
  DOCUMENT_EXTENSIONS.contains(&ext.to_lowercase().as_str())
}

/// Languages the syntax-aware splitter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
  Rust,
  Python,
  JavaScript,
  TypeScript,
  Tsx,
  Go,
  Java,
  C,
  Cpp,
}

impl Language {
  pub fn from_extension(ext: &str) -> Option<Self> {
    match ext.to_lowercase().as_str() {
      "rs" => Some(Language::Rust),
      "py" | "pyi" => Some(Language::Python),
      "js" | "mjs" | "cjs" | "jsx" => Some(Language::JavaScript),
      "ts" | "mts" | "cts" => Some(Language::TypeScript),
      "tsx" => Some(Language::Tsx),
      "go" => Some(Language::Go),
      "java" => Some(Language::Java),
      "c" | "h" => Some(Language::C),
      "cpp" | "cc" | "cxx" | "hpp" | "hh" => Some(Language::Cpp),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Language::Rust => "rust",
      Language::Python => "python",
      Language::JavaScript => "javascript",
      Language::TypeScript => "typescript",
      Language::Tsx => "tsx",
      Language::Go => "go",
      Language::Java => "java",
      Language::C => "c",
      Language::Cpp => "cpp",
    }
  }
}

/// Classify a file by extension. Files with a recognized code extension
/// are code; everything else (including extensionless files) is treated
/// as a document and later skipped if it is not valid UTF-8.
pub fn classify(ext: Option<&str>) -> (SourceType, Option<Language>) {
  match ext {
    Some(ext) => {
      if let Some(language) = Language::from_extension(ext) {
        (SourceType::Code, Some(language))
      } else {
        (SourceType::Doc, None)
      }
    }
    None => (SourceType::Doc, None),
  }
}
