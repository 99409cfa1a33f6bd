//! Data types for paper metadata and artifacts.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate status of a paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl PaperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PaperStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaperStatus {
    type Err = deepread_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(deepread_core::Error::Validation(format!(
                "Invalid paper status: {}",
                other
            ))),
        }
    }
}

/// Last known state of one workflow applied to a paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub status: PaperStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-paper metadata record, stored as `.metadata/<paper_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub paper_id: String,
    pub category: String,
    pub original_filename: String,
    /// Sanitized filename embedded in the paper id.
    pub filename: String,
    pub size: u64,
    pub upload_time: DateTime<Utc>,
    pub status: PaperStatus,
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowState>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Fields merged in by `update_metadata` patches.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PaperMetadata {
    pub fn new(
        paper_id: impl Into<String>,
        category: impl Into<String>,
        original_filename: impl Into<String>,
        filename: impl Into<String>,
        size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            paper_id: paper_id.into(),
            category: category.into(),
            original_filename: original_filename.into(),
            filename: filename.into(),
            size,
            upload_time: now,
            status: PaperStatus::Uploaded,
            workflows: BTreeMap::new(),
            updated_at: now,
            content_hash: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Filter applied to paper listings.
#[derive(Debug, Clone, Default)]
pub struct PaperFilter {
    pub category: Option<String>,
    pub status: Option<PaperStatus>,
}

impl PaperFilter {
    pub fn matches(&self, meta: &PaperMetadata) -> bool {
        if let Some(category) = &self.category {
            if &meta.category != category {
                return false;
            }
        }
        if let Some(status) = self.status {
            if meta.status != status {
                return false;
            }
        }
        true
    }
}

/// Artifact content as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Bytes(Vec<u8>),
    Text(String),
    Tree(serde_json::Value),
}

impl Artifact {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Result of writing a source document.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub size: u64,
    pub content_hash: String,
    pub path: PathBuf,
}

/// Result of a cascade delete.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub deleted: bool,
    /// Artifact kinds whose removal failed (logged, not fatal).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_artifacts: Vec<String>,
}
