//! Context-aware recursive text splitter.
//!
//! Splits on progressively finer separators (paragraph, line, sentence,
//! word) so chunks end on natural boundaries, packs segments up to the
//! token target, and overlaps adjacent chunks.

use recall_core::CHARS_PER_TOKEN;

/// Separators tried in order, coarsest first.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

#[derive(Debug, Clone)]
pub struct SplitParams {
  /// Target chunk size in estimated tokens (default: 512).
  pub target_tokens: usize,
  /// Overlap between adjacent chunks in estimated tokens (default: 50).
  pub overlap_tokens: usize,
}

impl Default for SplitParams {
  fn default() -> Self {
    Self {
      target_tokens: 512,
      overlap_tokens: 50,
    }
  }
}

impl SplitParams {
  pub fn target_chars(&self) -> usize {
    (self.target_tokens * CHARS_PER_TOKEN).max(1)
  }

  pub fn overlap_chars(&self) -> usize {
    self.overlap_tokens * CHARS_PER_TOKEN
  }
}

/// One produced chunk body with its character offset in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPiece {
  pub body: String,
  /// Character offset of `body` within the original content (for
  /// overlapped chunks, the offset of the overlap start).
  pub offset: usize,
}

/// Split text into chunks of roughly `target_tokens`, overlapping
/// adjacent chunks by `overlap_tokens`. Whitespace-only chunks are
/// dropped.
pub fn split_text(content: &str, params: &SplitParams) -> Vec<TextPiece> {
  if content.trim().is_empty() {
    return Vec::new();
  }

  let target = params.target_chars();
  let chars: Vec<char> = content.chars().collect();
  if chars.len() <= target {
    return vec![TextPiece {
      body: content.to_string(),
      offset: 0,
    }];
  }

  // Segment recursively so no segment exceeds the target, then pack.
  let segments = segment(content, 0, target, 0);

  let mut pieces = Vec::new();
  let mut current = String::new();
  let mut current_offset = 0usize;
  let mut current_chars = 0usize;

  for (offset, body) in &segments {
    let body_chars = body.chars().count();
    if current_chars > 0 && current_chars + body_chars > target {
      pieces.push((current_offset, std::mem::take(&mut current)));
      current_chars = 0;
    }
    if current_chars == 0 {
      current_offset = *offset;
    }
    current.push_str(body);
    current_chars += body_chars;
  }
  if !current.trim().is_empty() {
    pieces.push((current_offset, current));
  }

  apply_overlap(&chars, pieces, params.overlap_chars())
    .into_iter()
    .filter(|piece| !piece.body.trim().is_empty())
    .collect()
}

/// Recursively split `content` (starting at char `base_offset`) into
/// segments no longer than `target` chars, using the separator at
/// `level`, descending to finer separators for oversized parts.
fn segment(content: &str, base_offset: usize, target: usize, level: usize) -> Vec<(usize, String)> {
  if content.chars().count() <= target {
    return vec![(base_offset, content.to_string())];
  }

  if level >= SEPARATORS.len() {
    // No separators left: hard split at character boundaries.
    let chars: Vec<char> = content.chars().collect();
    return chars
      .chunks(target)
      .enumerate()
      .map(|(i, chunk)| (base_offset + i * target, chunk.iter().collect()))
      .collect();
  }

  let separator = SEPARATORS[level];
  let mut out = Vec::new();
  let mut offset = base_offset;
  for part in split_inclusive_str(content, separator) {
    out.extend(segment(&part, offset, target, level + 1));
    offset += part.chars().count();
  }
  out
}

/// Split on a separator, keeping the separator attached to the preceding
/// part so offsets stay contiguous.
fn split_inclusive_str(content: &str, separator: &str) -> Vec<String> {
  let mut parts = Vec::new();
  let mut rest = content;
  while let Some(position) = rest.find(separator) {
    let end = position + separator.len();
    parts.push(rest[..end].to_string());
    rest = &rest[end..];
  }
  if !rest.is_empty() {
    parts.push(rest.to_string());
  }
  parts
}

/// Prepend the tail of the previous chunk to each subsequent chunk.
fn apply_overlap(chars: &[char], pieces: Vec<(usize, String)>, overlap: usize) -> Vec<TextPiece> {
  pieces
    .into_iter()
    .map(|(offset, body)| {
      if overlap == 0 || offset == 0 {
        return TextPiece { body, offset };
      }
      let start = offset.saturating_sub(overlap);
      let prefix: String = chars[start..offset].iter().collect();
      TextPiece {
        body: format!("{}{}", prefix, body),
        offset: start,
      }
    })
    .collect()
}
