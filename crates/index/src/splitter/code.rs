//! Syntax-aware code splitter.
//!
//! Parses the file with tree-sitter and groups consecutive top-level
//! items (functions, types, impl blocks) into chunks up to the token
//! target, so chunk boundaries land between definitions instead of in
//! the middle of one. Oversized single items are split by the recursive
//! text splitter. Returns None when parsing is not possible; the caller
//! falls back to the text splitter.

use tracing::trace;

use crate::language::Language;
use crate::splitter::text::{SplitParams, TextPiece, split_text};

fn grammar_for(language: Language) -> tree_sitter::Language {
  match language {
    Language::Rust => tree_sitter_rust::LANGUAGE.into(),
    Language::Python => tree_sitter_python::LANGUAGE.into(),
    Language::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
    Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
    Language::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
    Language::Go => tree_sitter_go::LANGUAGE.into(),
    Language::Java => tree_sitter_java::LANGUAGE.into(),
    Language::C => tree_sitter_c::LANGUAGE.into(),
    Language::Cpp => tree_sitter_cpp::LANGUAGE.into(),
  }
}

/// Split source code at syntactic boundaries.
///
/// Returns None when the file cannot be parsed into top-level items, in
/// which case the caller should use the recursive text splitter.
pub fn split_code(source: &str, language: Language, params: &SplitParams) -> Option<Vec<TextPiece>> {
  let mut parser = tree_sitter::Parser::new();
  parser.set_language(&grammar_for(language)).ok()?;
  let tree = parser.parse(source, None)?;
  let root = tree.root_node();

  let mut cursor = root.walk();
  let children: Vec<_> = root.named_children(&mut cursor).collect();
  if children.is_empty() {
    return None;
  }

  // Contiguous byte segments, one per top-level item. Trivia between
  // items (comments, blank lines) attaches to the item that follows it.
  let mut segments: Vec<&str> = Vec::new();
  let mut start = 0usize;
  for child in &children {
    let end = child.end_byte().max(start);
    if end > start {
      segments.push(source.get(start..end)?);
      start = end;
    }
  }
  if start < source.len() {
    segments.push(source.get(start..)?);
  }

  trace!(
    language = language.as_str(),
    top_level_items = children.len(),
    segments = segments.len(),
    "Split code by syntactic boundaries"
  );

  let target = params.target_chars();
  let mut pieces = Vec::new();
  let mut current = String::new();
  let mut current_offset = 0usize;
  let mut current_chars = 0usize;
  let mut char_offset = 0usize;

  for segment in segments {
    let segment_chars = segment.chars().count();

    if segment_chars > target {
      // An item bigger than the whole target: emit what we have, then
      // let the recursive splitter break the item itself.
      flush(&mut pieces, &mut current, current_offset);
      current_chars = 0;
      for inner in split_text(segment, params) {
        pieces.push(TextPiece {
          body: inner.body,
          offset: char_offset + inner.offset,
        });
      }
      char_offset += segment_chars;
      continue;
    }

    if current_chars > 0 && current_chars + segment_chars > target {
      flush(&mut pieces, &mut current, current_offset);
      current_chars = 0;
    }
    if current_chars == 0 {
      current_offset = char_offset;
    }
    current.push_str(segment);
    current_chars += segment_chars;
    char_offset += segment_chars;
  }
  flush(&mut pieces, &mut current, current_offset);

  Some(pieces)
}

fn flush(pieces: &mut Vec<TextPiece>, current: &mut String, offset: usize) {
  if current.trim().is_empty() {
    current.clear();
    return;
  }
  pieces.push(TextPiece {
    body: std::mem::take(current),
    offset,
  });
}
