//! DeepRead Core: error taxonomy, configuration, paper identity, document types.

pub mod config;
pub mod document;
pub mod error;
pub mod paper;

pub use config::{BatchDefaults, DataPaths, DeepReadConfig};
pub use document::{
    AnalysisOutput, AnalysisStats, AnalysisTree, ExtractOptions, ExtractedDocument, ImageRef,
};
pub use error::{Error, Result};
pub use paper::{ArtifactKind, ContentKind};
