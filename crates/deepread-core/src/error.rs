//! Error types for DeepRead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Input shape or range violated (non-PDF upload, oversized file, bad content kind).
    #[error("{0}")]
    Validation(String),

    #[error("Paper not found: {0}")]
    PaperNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Artifact not found: {kind} for {paper_id}")]
    ArtifactNotFound { paper_id: String, kind: String },

    /// An external capability returned a failure or timed out.
    #[error("{0}")]
    Capability(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for every "missing entity" variant.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PaperNotFound(_) | Self::TaskNotFound(_) | Self::ArtifactNotFound { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(Error::PaperNotFound("x".into()).is_not_found());
        assert!(Error::TaskNotFound("t".into()).is_not_found());
        assert!(Error::ArtifactNotFound {
            paper_id: "p".into(),
            kind: "translation".into()
        }
        .is_not_found());
        assert!(!Error::Validation("bad".into()).is_not_found());
        assert!(!Error::Storage("disk".into()).is_not_found());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::ArtifactNotFound {
            paper_id: "general_20240101_000000_a.pdf".into(),
            kind: "report".into(),
        };
        assert_eq!(
            err.to_string(),
            "Artifact not found: report for general_20240101_000000_a.pdf"
        );
        assert_eq!(
            Error::Validation("Only PDF files are accepted".into()).to_string(),
            "Only PDF files are accepted"
        );
    }
}
