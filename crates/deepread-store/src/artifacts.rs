//! Filesystem artifact store keyed by `(paper_id, kind)`.
//!
//! Layout under the data root:
//! `source/<category>/<paper_id>`, `extract/<category>/<stem>.md`,
//! `translation/<category>/<stem>.md`, `analysis/<category>/<stem>.{md,json}`,
//! `analysis/<category>/<stem>_report.md`, `.metadata/<paper_id>.json`.
//! The category comes from the metadata record, falling back to the
//! `paper_id` prefix when the record is missing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use deepread_core::paper::{category_from_paper_id, sanitize_filename};
use deepread_core::{ArtifactKind, DataPaths, Error, Result};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::*;

/// Filesystem-backed store for paper artifacts and metadata.
pub struct ArtifactStore {
    paths: DataPaths,
    /// Serializes metadata read-modify-write cycles.
    metadata_lock: Mutex<()>,
}

impl ArtifactStore {
    pub fn open(paths: DataPaths) -> Self {
        info!("ArtifactStore initialized at {}", paths.root.display());
        Self {
            paths,
            metadata_lock: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    // ---------------------------------------------------------------
    // Layout
    // ---------------------------------------------------------------

    fn namespace(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Source => &self.paths.source,
            ArtifactKind::Extract => &self.paths.extract,
            ArtifactKind::Translation => &self.paths.translation,
            ArtifactKind::Analysis | ArtifactKind::AnalysisStructured | ArtifactKind::Report => {
                &self.paths.analysis
            }
        }
    }

    /// Path of an artifact given an explicit category.
    pub fn artifact_path(&self, paper_id: &str, category: &str, kind: ArtifactKind) -> PathBuf {
        let stem = paper_id.strip_suffix(".pdf").unwrap_or(paper_id);
        let file_name = match kind {
            ArtifactKind::Source => paper_id.to_string(),
            ArtifactKind::Extract | ArtifactKind::Translation | ArtifactKind::Analysis => {
                format!("{}.md", stem)
            }
            ArtifactKind::AnalysisStructured => format!("{}.json", stem),
            ArtifactKind::Report => format!("{}_report.md", stem),
        };
        self.namespace(kind).join(category).join(file_name)
    }

    fn metadata_path(&self, paper_id: &str) -> PathBuf {
        self.paths.metadata.join(format!("{}.json", paper_id))
    }

    /// Category for a paper: metadata first, `paper_id` prefix otherwise.
    pub async fn category_of(&self, paper_id: &str) -> String {
        match self.get_metadata(paper_id).await {
            Ok(meta) => meta.category,
            Err(_) => category_from_paper_id(paper_id),
        }
    }

    /// Resolve the on-disk path of an existing artifact.
    pub async fn locate(&self, paper_id: &str, kind: ArtifactKind) -> Result<PathBuf> {
        check_component("paper_id", paper_id)?;
        let category = self.category_of(paper_id).await;
        let path = self.artifact_path(paper_id, &category, kind);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Ok(path)
        } else {
            Err(not_found(paper_id, kind))
        }
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    /// Write the original document bytes.
    pub async fn put_source(
        &self,
        paper_id: &str,
        bytes: &[u8],
        category: &str,
        original_filename: &str,
    ) -> Result<SourceInfo> {
        check_component("paper_id", paper_id)?;
        check_component("category", category)?;
        let path = self.artifact_path(paper_id, category, ArtifactKind::Source);
        write_atomic(&path, bytes).await?;
        let content_hash = hex::encode(Sha256::digest(bytes));
        debug!(
            "Stored source {} ({} bytes, original '{}')",
            paper_id,
            bytes.len(),
            original_filename
        );
        Ok(SourceInfo {
            size: bytes.len() as u64,
            content_hash,
            path,
        })
    }

    /// Write a markdown-bodied artifact (`extract`, `translation`, `analysis`, `report`).
    pub async fn put_text(&self, paper_id: &str, kind: ArtifactKind, text: &str) -> Result<PathBuf> {
        if !kind.is_text() {
            return Err(Error::Validation(format!("{} is not a text artifact", kind)));
        }
        check_component("paper_id", paper_id)?;
        let category = self.category_of(paper_id).await;
        check_component("category", &category)?;
        let path = self.artifact_path(paper_id, &category, kind);
        write_atomic(&path, text.as_bytes()).await?;
        debug!("Stored {} for {} ({} chars)", kind, paper_id, text.chars().count());
        Ok(path)
    }

    /// Write a key-value tree artifact (`analysis_structured`).
    pub async fn put_structured(
        &self,
        paper_id: &str,
        kind: ArtifactKind,
        tree: &serde_json::Value,
    ) -> Result<PathBuf> {
        if kind != ArtifactKind::AnalysisStructured {
            return Err(Error::Validation(format!("{} is not a structured artifact", kind)));
        }
        check_component("paper_id", paper_id)?;
        let category = self.category_of(paper_id).await;
        check_component("category", &category)?;
        let path = self.artifact_path(paper_id, &category, kind);
        let data = serde_json::to_vec_pretty(tree)?;
        write_atomic(&path, &data).await?;
        Ok(path)
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    pub async fn get(&self, paper_id: &str, kind: ArtifactKind) -> Result<Artifact> {
        let path = self.locate(paper_id, kind).await?;
        let read = |e: std::io::Error| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found(paper_id, kind)
            } else {
                Error::Storage(format!("Failed to read {}: {}", path.display(), e))
            }
        };
        match kind {
            ArtifactKind::Source => Ok(Artifact::Bytes(tokio::fs::read(&path).await.map_err(read)?)),
            ArtifactKind::AnalysisStructured => {
                let data = tokio::fs::read(&path).await.map_err(read)?;
                Ok(Artifact::Tree(serde_json::from_slice(&data)?))
            }
            _ => Ok(Artifact::Text(
                tokio::fs::read_to_string(&path).await.map_err(read)?,
            )),
        }
    }

    pub async fn get_text(&self, paper_id: &str, kind: ArtifactKind) -> Result<String> {
        match self.get(paper_id, kind).await? {
            Artifact::Text(text) => Ok(text),
            _ => Err(Error::Internal(format!("{} is not a text artifact", kind))),
        }
    }

    /// List metadata records, newest upload first.
    ///
    /// `total` is the filtered count at call time; the page is `[offset, offset + limit)`.
    pub async fn list(
        &self,
        filter: &PaperFilter,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<PaperMetadata>, usize)> {
        let mut papers = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.paths.metadata).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_metadata_file(&path).await {
                Ok(meta) => {
                    if filter.matches(&meta) {
                        papers.push(meta);
                    }
                }
                Err(e) => warn!("Skipping unreadable metadata {}: {}", path.display(), e),
            }
        }

        papers.sort_by(|a, b| {
            b.upload_time
                .cmp(&a.upload_time)
                .then_with(|| b.paper_id.cmp(&a.paper_id))
        });
        let total = papers.len();
        let page = papers.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    // ---------------------------------------------------------------
    // Metadata
    // ---------------------------------------------------------------

    pub async fn exists(&self, paper_id: &str) -> bool {
        if check_component("paper_id", paper_id).is_err() {
            return false;
        }
        tokio::fs::try_exists(self.metadata_path(paper_id))
            .await
            .unwrap_or(false)
    }

    pub async fn get_metadata(&self, paper_id: &str) -> Result<PaperMetadata> {
        check_component("paper_id", paper_id)?;
        let path = self.metadata_path(paper_id);
        match read_metadata_file(&path).await {
            Ok(meta) => Ok(meta),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::PaperNotFound(paper_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Write a full metadata record, replacing any previous one.
    pub async fn put_metadata(&self, meta: &PaperMetadata) -> Result<()> {
        let _guard = self.metadata_lock.lock().await;
        self.write_metadata(meta).await
    }

    async fn write_metadata(&self, meta: &PaperMetadata) -> Result<()> {
        check_component("paper_id", &meta.paper_id)?;
        let data = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.metadata_path(&meta.paper_id), &data).await
    }

    /// Shallow-merge `patch` into the record; always bumps `updated_at`.
    /// `paper_id` is immutable and ignored if present in the patch.
    pub async fn update_metadata(
        &self,
        paper_id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PaperMetadata> {
        let _guard = self.metadata_lock.lock().await;
        let meta = self.get_metadata(paper_id).await?;

        let mut value = serde_json::to_value(&meta)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| Error::Internal("metadata is not an object".into()))?;
        for (key, v) in patch {
            if key == "paper_id" {
                continue;
            }
            obj.insert(key, v);
        }
        obj.insert("updated_at".into(), serde_json::to_value(Utc::now())?);

        let updated: PaperMetadata = serde_json::from_value(value)?;
        self.write_metadata(&updated).await?;
        Ok(updated)
    }

    /// Record the state of one workflow and mirror it into the aggregate status.
    pub async fn set_workflow_status(
        &self,
        paper_id: &str,
        workflow: &str,
        status: PaperStatus,
        error: Option<String>,
    ) -> Result<PaperMetadata> {
        let _guard = self.metadata_lock.lock().await;
        let mut meta = self.get_metadata(paper_id).await?;
        let now = Utc::now();
        meta.workflows.insert(
            workflow.to_string(),
            WorkflowState {
                status,
                updated_at: now,
                error: if status == PaperStatus::Failed { error } else { None },
            },
        );
        meta.status = status;
        meta.updated_at = now;
        self.write_metadata(&meta).await?;
        Ok(meta)
    }

    // ---------------------------------------------------------------
    // Delete
    // ---------------------------------------------------------------

    /// Remove every artifact kind and the metadata record.
    ///
    /// Missing artifacts are not errors; failed artifact removals are logged and
    /// reported. The delete succeeds only if the metadata record was removed.
    pub async fn delete(&self, paper_id: &str) -> Result<DeleteOutcome> {
        let _guard = self.metadata_lock.lock().await;
        let meta = self.get_metadata(paper_id).await?;
        check_component("category", &meta.category)?;

        let mut failed_artifacts = Vec::new();
        for kind in ArtifactKind::ALL {
            let path = self.artifact_path(paper_id, &meta.category, kind);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {} for {}", kind, paper_id),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove {} for {}: {}", kind, paper_id, e);
                    failed_artifacts.push(kind.as_str().to_string());
                }
            }
        }

        tokio::fs::remove_file(self.metadata_path(paper_id))
            .await
            .map_err(|e| Error::Storage(format!("Failed to remove metadata for {}: {}", paper_id, e)))?;

        info!("Deleted paper {}", paper_id);
        Ok(DeleteOutcome {
            deleted: true,
            failed_artifacts,
        })
    }

    /// Best-effort removal of a source file written before its metadata existed.
    pub async fn discard_source(&self, paper_id: &str, category: &str) {
        if check_component("paper_id", paper_id).is_err() || check_component("category", category).is_err() {
            return;
        }
        let path = self.artifact_path(paper_id, category, ArtifactKind::Source);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to discard orphan source {}: {}", path.display(), e);
            }
        }
    }
}

fn not_found(paper_id: &str, kind: ArtifactKind) -> Error {
    Error::ArtifactNotFound {
        paper_id: paper_id.to_string(),
        kind: kind.as_str().to_string(),
    }
}

/// Ids and categories become single path components under the data root.
/// Anything that would not survive `sanitize_filename` unchanged, or that is
/// hidden (`.`, `..`, `.metadata`), is rejected.
fn check_component(label: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.starts_with('.') || sanitize_filename(value) != value {
        return Err(Error::Validation(format!("Invalid {}: {:?}", label, value)));
    }
    Ok(())
}

async fn read_metadata_file(path: &Path) -> Result<PaperMetadata> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write via a sibling temp file and rename, creating parent directories.
/// Each call gets its own temp file so concurrent writers of one path never
/// rename each other's data; the last rename wins.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Storage(format!("No parent directory for {}", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = parent.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::Storage(format!("Failed to write {}: {}", path.display(), e)));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::Storage(format!("Failed to finalize {}: {}", path.display(), e)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (ArtifactStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        (ArtifactStore::open(paths), dir)
    }

    async fn seed(store: &ArtifactStore, paper_id: &str, category: &str) -> PaperMetadata {
        let bytes = b"%PDF-1.4 test";
        let info = store
            .put_source(paper_id, bytes, category, "orig.pdf")
            .await
            .unwrap();
        let mut meta = PaperMetadata::new(paper_id, category, "orig.pdf", "orig.pdf", info.size);
        meta.content_hash = Some(info.content_hash);
        store.put_metadata(&meta).await.unwrap();
        meta
    }

    #[tokio::test]
    async fn test_source_round_trip() {
        let (store, _dir) = test_store();
        let id = "rag_20240101_000000_orig.pdf";
        let bytes = b"%PDF-1.4 \x00\x01\x02 binary".to_vec();
        let info = store.put_source(id, &bytes, "rag", "orig.pdf").await.unwrap();
        assert_eq!(info.size, bytes.len() as u64);
        assert_eq!(info.content_hash.len(), 64);
        assert!(info.path.starts_with(store.paths().source.join("rag")));

        // No metadata yet: category recovered from the id prefix.
        let back = store.get(id, ArtifactKind::Source).await.unwrap();
        assert_eq!(back, Artifact::Bytes(bytes));
    }

    #[tokio::test]
    async fn test_text_and_structured_artifacts() {
        let (store, _dir) = test_store();
        let id = "survey_20240101_000000_orig.pdf";
        seed(&store, id, "survey").await;

        let path = store
            .put_text(id, ArtifactKind::Translation, "# 标题\n\n正文")
            .await
            .unwrap();
        assert!(path.ends_with("survey/survey_20240101_000000_orig.md"));
        assert_eq!(
            store.get_text(id, ArtifactKind::Translation).await.unwrap(),
            "# 标题\n\n正文"
        );

        let tree = serde_json::json!({"summary": "s", "key_points": ["a"]});
        store
            .put_structured(id, ArtifactKind::AnalysisStructured, &tree)
            .await
            .unwrap();
        assert_eq!(
            store.get(id, ArtifactKind::AnalysisStructured).await.unwrap(),
            Artifact::Tree(tree)
        );

        // Overwrite is idempotent
        store.put_text(id, ArtifactKind::Translation, "v2").await.unwrap();
        assert_eq!(store.get_text(id, ArtifactKind::Translation).await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_wrong_kind_rejected() {
        let (store, _dir) = test_store();
        let err = store
            .put_text("x_1_a.pdf", ArtifactKind::AnalysisStructured, "nope")
            .await
            .unwrap_err();
        assert!(err.is_validation());
        let err = store
            .put_structured("x_1_a.pdf", ArtifactKind::Report, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let (store, _dir) = test_store();
        let id = "rag_20240101_000000_orig.pdf";
        seed(&store, id, "rag").await;
        let err = store.get(id, ArtifactKind::Translation).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_metadata_shallow_merge() {
        let (store, _dir) = test_store();
        let id = "rag_20240101_000000_orig.pdf";
        let before = seed(&store, id, "rag").await;

        let mut patch = serde_json::Map::new();
        patch.insert("status".into(), serde_json::json!("processing"));
        patch.insert("paper_id".into(), serde_json::json!("hijacked"));
        patch.insert("extract".into(), serde_json::json!({"page_count": 3}));
        let after = store.update_metadata(id, patch).await.unwrap();

        assert_eq!(after.paper_id, id);
        assert_eq!(after.status, PaperStatus::Processing);
        assert_eq!(after.extra["extract"]["page_count"], 3);
        assert!(after.updated_at >= before.updated_at);

        let reread = store.get_metadata(id).await.unwrap();
        assert_eq!(reread, after);
    }

    #[tokio::test]
    async fn test_workflow_status_map() {
        let (store, _dir) = test_store();
        let id = "rag_20240101_000000_orig.pdf";
        seed(&store, id, "rag").await;

        store
            .set_workflow_status(id, "translate_only", PaperStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        let meta = store
            .set_workflow_status(id, "extract_only", PaperStatus::Completed, Some("ignored".into()))
            .await
            .unwrap();

        assert_eq!(meta.workflows.len(), 2);
        assert_eq!(meta.workflows["translate_only"].error.as_deref(), Some("boom"));
        assert_eq!(meta.workflows["extract_only"].error, None);
        assert_eq!(meta.status, PaperStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_filter_and_pagination() {
        let (store, _dir) = test_store();
        for i in 0..5 {
            let category = if i % 2 == 0 { "rag" } else { "survey" };
            let id = format!("{}_2024010{}_000000_p{}.pdf", category, i, i);
            let mut meta = seed(&store, &id, category).await;
            meta.upload_time = meta.upload_time + chrono::Duration::seconds(i);
            store.put_metadata(&meta).await.unwrap();
        }

        let (all, total) = store.list(&PaperFilter::default(), 0, 100).await.unwrap();
        assert_eq!(total, 5);
        assert!(all.windows(2).all(|w| w[0].upload_time >= w[1].upload_time));

        let (page, total) = store.list(&PaperFilter::default(), 2, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].paper_id, all[2].paper_id);

        let filter = PaperFilter {
            category: Some("rag".into()),
            status: None,
        };
        let (_, rag_total) = store.list(&filter, 0, 100).await.unwrap();
        assert_eq!(rag_total, 3);

        let filter = PaperFilter {
            category: Some("rag".into()),
            status: Some(PaperStatus::Completed),
        };
        let (_, narrowed) = store.list(&filter, 0, 100).await.unwrap();
        assert!(narrowed <= rag_total);
    }

    #[tokio::test]
    async fn test_delete_cascade() {
        let (store, _dir) = test_store();
        let id = "rag_20240101_000000_orig.pdf";
        seed(&store, id, "rag").await;
        store.put_text(id, ArtifactKind::Extract, "body").await.unwrap();
        store.put_text(id, ArtifactKind::Report, "report").await.unwrap();

        let outcome = store.delete(id).await.unwrap();
        assert!(outcome.deleted);
        assert!(outcome.failed_artifacts.is_empty());

        assert!(matches!(
            store.get_metadata(id).await.unwrap_err(),
            Error::PaperNotFound(_)
        ));
        assert!(store.get(id, ArtifactKind::Source).await.is_err());
        assert!(!store.artifact_path(id, "rag", ArtifactKind::Extract).exists());

        // Second delete: metadata absent
        assert!(matches!(
            store.delete(id).await.unwrap_err(),
            Error::PaperNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_artifact() {
        let (store, _dir) = test_store();
        let id = "rag_20240101_000000_orig.pdf";
        seed(&store, id, "rag").await;

        for round in 0..100 {
            let a = format!("first {}", round);
            let b = format!("second {}", round);
            let (ra, rb) = tokio::join!(
                store.put_text(id, ArtifactKind::Translation, &a),
                store.put_text(id, ArtifactKind::Translation, &b),
            );
            ra.unwrap();
            rb.unwrap();
            let stored = store.get_text(id, ArtifactKind::Translation).await.unwrap();
            assert!(stored == a || stored == b, "torn write: {:?}", stored);
        }

        // No temp files left behind
        let dir = store.paths().translation.join("rag");
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["rag_20240101_000000_orig.md".to_string()]);
    }

    #[tokio::test]
    async fn test_path_escaping_ids_rejected() {
        let (store, _dir) = test_store();
        let id = "rag_20240101_000000_a.pdf";
        seed(&store, id, "rag").await;

        let escaping = format!("../.metadata/{}", id);
        for bad in [
            escaping.as_str(),
            "..",
            "",
            ".metadata",
            "a/b.pdf",
            "a\\b.pdf",
        ] {
            assert!(store.delete(bad).await.unwrap_err().is_validation(), "{:?}", bad);
            assert!(store.get_metadata(bad).await.unwrap_err().is_validation(), "{:?}", bad);
            assert!(!store.exists(bad).await, "{:?}", bad);
        }
        assert!(store
            .put_text(&escaping, ArtifactKind::Extract, "x")
            .await
            .unwrap_err()
            .is_validation());
        assert!(store
            .put_source("x_1_a.pdf", b"%PDF", "../rag", "a.pdf")
            .await
            .unwrap_err()
            .is_validation());
        assert!(store
            .get(&escaping, ArtifactKind::Source)
            .await
            .unwrap_err()
            .is_validation());

        // The real record and source are untouched.
        assert_eq!(store.get_metadata(id).await.unwrap().paper_id, id);
        assert!(store.get(id, ArtifactKind::Source).await.is_ok());
    }
}
