//! Core domain types for Recall.
//!
//! This crate contains the canonical types shared by every layer: the
//! configuration system, the chunk/search-result data model, the failure
//! taxonomy surfaced at operation boundaries, the file-type preset
//! registry, and path canonicalization. It is independent of any storage
//! backend or provider.

pub mod config;
pub mod failure;
pub mod paths;
pub mod presets;
pub mod types;

/// Estimated characters per token, used wherever token counts are
/// approximated from text length (chunk targets, context limits).
pub const CHARS_PER_TOKEN: usize = 4;
