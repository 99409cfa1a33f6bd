//! DeepRead Store: category-partitioned artifact files + per-paper metadata records.

pub mod artifacts;
pub mod types;

pub use artifacts::ArtifactStore;
pub use types::*;
