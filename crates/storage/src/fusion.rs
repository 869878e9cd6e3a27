//! Reciprocal Rank Fusion.
//!
//! Rank-based fusion of any number of result lists: a result at 1-indexed
//! rank `r` in a list with weight `w` contributes `w / (60 + r)` to its
//! fused score. Used by both the backends' hybrid search and the query
//! engine's multi-signal fusion.

use std::collections::BTreeMap;

use recall_core::types::SearchResult;

/// The RRF rank constant.
pub const RRF_K: f32 = 60.0;

/// One ranked input list with its fusion weight.
pub struct RankedList<'a> {
  pub weight: f32,
  pub results: &'a [SearchResult],
  /// When true, this list's original scores are used for tie-breaking
  /// (the vector list, by convention).
  pub tie_breaking: bool,
}

impl<'a> RankedList<'a> {
  pub fn new(weight: f32, results: &'a [SearchResult]) -> Self {
    Self {
      weight,
      results,
      tie_breaking: false,
    }
  }

  pub fn tie_breaking(weight: f32, results: &'a [SearchResult]) -> Self {
    Self {
      weight,
      results,
      tie_breaking: true,
    }
  }
}

struct Candidate {
  result: SearchResult,
  fused: f32,
  tie_score: f32,
}

/// Fuse ranked lists, min-max normalize the fused scores to [0, 1], and
/// return the top_k.
///
/// Merging is by chunk id. Ties break on the tie-breaking list's original
/// score (descending), then lexicographic chunk id, which makes the
/// output fully deterministic for fixed inputs.
pub fn reciprocal_rank_fusion(lists: &[RankedList<'_>], top_k: usize) -> Vec<SearchResult> {
  let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();

  for list in lists {
    for (rank, result) in list.results.iter().enumerate() {
      let contribution = list.weight / (RRF_K + (rank + 1) as f32);
      let entry = candidates.entry(result.chunk_id.clone()).or_insert_with(|| Candidate {
        result: result.clone(),
        fused: 0.0,
        tie_score: 0.0,
      });
      entry.fused += contribution;
      if list.tie_breaking {
        entry.tie_score = entry.tie_score.max(result.score);
      }
    }
  }

  let mut merged: Vec<Candidate> = candidates.into_values().collect();
  merged.sort_by(|a, b| {
    b.fused
      .partial_cmp(&a.fused)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| {
        b.tie_score
          .partial_cmp(&a.tie_score)
          .unwrap_or(std::cmp::Ordering::Equal)
      })
      .then_with(|| a.result.chunk_id.cmp(&b.result.chunk_id))
  });

  let max = merged.first().map(|c| c.fused).unwrap_or(0.0);
  let min = merged.last().map(|c| c.fused).unwrap_or(0.0);
  let range = max - min;

  merged
    .into_iter()
    .take(top_k)
    .map(|candidate| {
      let score = if range > 0.0 {
        (candidate.fused - min) / range
      } else {
        1.0
      };
      SearchResult {
        score,
        rerank_score: None,
        original_rank: None,
        ..candidate.result
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use recall_core::types::{ChunkMetadata, SourceType};

  use super::*;

  fn result(id: &str, score: f32) -> SearchResult {
    SearchResult {
      chunk_id: id.to_string(),
      text: format!("text for {}", id),
      metadata: ChunkMetadata::new(format!("/{}", id), id, SourceType::Doc),
      score,
      rerank_score: None,
      original_rank: None,
    }
  }

  #[test]
  fn test_fusion_prefers_results_in_both_lists() {
    let vector = vec![result("a", 0.9), result("b", 0.8)];
    let keyword = vec![result("b", 1.0), result("c", 0.5)];

    let fused = reciprocal_rank_fusion(
      &[
        RankedList::tie_breaking(0.5, &vector),
        RankedList::new(0.5, &keyword),
      ],
      3,
    );

    assert_eq!(fused.len(), 3);
    assert_eq!(fused[0].chunk_id, "b", "result in both lists should win");
  }

  #[test]
  fn test_fusion_is_deterministic() {
    let vector = vec![result("a", 0.9), result("b", 0.8), result("c", 0.7)];
    let keyword = vec![result("c", 1.0), result("a", 0.4)];

    let lists = || {
      [
        RankedList::tie_breaking(0.5, &vector),
        RankedList::new(0.5, &keyword),
      ]
    };

    let first = reciprocal_rank_fusion(&lists(), 3);
    let second = reciprocal_rank_fusion(&lists(), 3);

    let ids = |results: &[SearchResult]| results.iter().map(|r| r.chunk_id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&first), ids(&second));
    for (a, b) in first.iter().zip(&second) {
      assert_eq!(a.score, b.score);
    }
  }

  #[test]
  fn test_tie_breaks_on_vector_score_then_id() {
    // b and c appear at the same rank in disjoint lists with equal
    // weights, so their fused scores tie exactly.
    let vector = vec![result("b", 0.9)];
    let keyword = vec![result("c", 1.0)];

    let fused = reciprocal_rank_fusion(
      &[
        RankedList::tie_breaking(0.5, &vector),
        RankedList::new(0.5, &keyword),
      ],
      2,
    );

    // b carries a vector tie-break score, c does not.
    assert_eq!(fused[0].chunk_id, "b");
    assert_eq!(fused[1].chunk_id, "c");
  }

  #[test]
  fn test_equal_ties_fall_back_to_chunk_id() {
    let first = vec![result("z", 0.5)];
    let second = vec![result("a", 0.5)];

    let fused = reciprocal_rank_fusion(&[RankedList::new(0.5, &first), RankedList::new(0.5, &second)], 2);
    assert_eq!(fused[0].chunk_id, "a");
    assert_eq!(fused[1].chunk_id, "z");
  }

  #[test]
  fn test_scores_normalized_to_unit_range() {
    let vector = vec![result("a", 0.9), result("b", 0.8), result("c", 0.7)];
    let keyword = vec![result("a", 1.0)];

    let fused = reciprocal_rank_fusion(
      &[
        RankedList::tie_breaking(0.5, &vector),
        RankedList::new(0.5, &keyword),
      ],
      3,
    );

    assert_eq!(fused[0].score, 1.0);
    assert_eq!(fused.last().unwrap().score, 0.0);
    for result in &fused {
      assert!((0.0..=1.0).contains(&result.score));
    }
  }

  #[test]
  fn test_single_candidate_scores_one() {
    let only = vec![result("a", 0.3)];
    let fused = reciprocal_rank_fusion(&[RankedList::new(1.0, &only)], 5);
    assert_eq!(fused.len(), 1);
    assert_eq!(fused[0].score, 1.0);
  }

  #[test]
  fn test_empty_lists_produce_empty_output() {
    let fused = reciprocal_rank_fusion(&[RankedList::new(0.5, &[]), RankedList::new(0.5, &[])], 10);
    assert!(fused.is_empty());
  }

  #[test]
  fn test_truncates_to_top_k() {
    let many: Vec<SearchResult> = (0..10).map(|i| result(&format!("c{}", i), 1.0 - i as f32 * 0.05)).collect();
    let fused = reciprocal_rank_fusion(&[RankedList::new(1.0, &many)], 3);
    assert_eq!(fused.len(), 3);
  }
}
