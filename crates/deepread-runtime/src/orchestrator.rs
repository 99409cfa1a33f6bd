//! Orchestrator: the single inbound surface for the HTTP and CLI layers.
//!
//! Owns the store, registry, bus, workflow engine and batch controller, and
//! attaches a task to every workflow submission.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use deepread_core::paper::{mint_paper_id, sanitize_category, sanitize_filename, with_suffix, DEFAULT_CATEGORY};
use deepread_core::{AnalysisTree, ArtifactKind, ContentKind, DeepReadConfig, Error, Result};
use deepread_llm::LlmConfig;
use deepread_store::{Artifact, ArtifactStore, DeleteOutcome, PaperFilter, PaperMetadata};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backends::default_invoker;
use crate::batch::{BatchController, BatchItem, BatchOptions, BatchReport, InvalidItem};
use crate::events::EventBus;
use crate::invoker::Invoker;
use crate::registry::{CancelOutcome, Task, TaskFilter, TaskRegistry, TaskStats, TaskStatus, TaskUpdate};
use crate::report::render_report;
use crate::workflow::{Workflow, WorkflowEngine, WorkflowOptions, WorkflowRequest, WorkflowResult};

#[derive(Debug, Clone, Serialize)]
pub struct UploadRecord {
    pub paper_id: String,
    pub filename: String,
    pub original_filename: String,
    pub category: String,
    pub size: u64,
    pub upload_time: DateTime<Utc>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub task_id: String,
    pub paper_id: String,
    pub workflow: Workflow,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkflowResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentView {
    pub paper_id: String,
    pub content_type: ContentKind,
    pub format: &'static str,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportView {
    pub paper_id: String,
    pub content: String,
    pub file_path: String,
    /// True when the report was rendered on this request.
    pub generated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    pub cleaned: usize,
    pub cutoff_time: DateTime<Utc>,
}

/// Top-level coordinator shared by every request handler.
pub struct Orchestrator {
    config: DeepReadConfig,
    store: Arc<ArtifactStore>,
    registry: Arc<TaskRegistry>,
    bus: Arc<EventBus>,
    engine: WorkflowEngine,
    batch: BatchController,
}

impl Orchestrator {
    /// Wire the runtime around an explicit capability invoker.
    pub fn new(config: DeepReadConfig, invoker: Invoker) -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(TaskRegistry::new(
            bus.clone(),
            Some(config.data_paths.task_logs.clone()),
        ));
        let store = Arc::new(ArtifactStore::open(config.data_paths.clone()));
        let engine = WorkflowEngine::new(
            invoker,
            store.clone(),
            registry.clone(),
            config.target_language.clone(),
            config.translate_batch_chars,
        );
        let batch = BatchController::new(
            engine.clone(),
            bus.clone(),
            config.batch,
            config.categories.clone(),
        );

        info!(
            "Orchestrator initialized: data={}, parallel_tasks={}, timeout={}s",
            config.data_paths.root.display(),
            config.batch.parallel_tasks,
            config.capability_timeout.as_secs()
        );

        Self {
            config,
            store,
            registry,
            bus,
            engine,
            batch,
        }
    }

    /// Production wiring: lopdf extraction plus the configured LLM provider.
    pub fn with_llm(config: DeepReadConfig) -> Self {
        let llm = LlmConfig::load(&config.data_paths.llm_config_file);
        let invoker = default_invoker(llm, config.capability_timeout);
        Self::new(config, invoker)
    }

    pub fn config(&self) -> &DeepReadConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ---------------------------------------------------------------
    // Papers
    // ---------------------------------------------------------------

    pub async fn upload(
        &self,
        bytes: &[u8],
        original_name: &str,
        category: Option<&str>,
    ) -> Result<UploadRecord> {
        if !original_name.to_lowercase().ends_with(".pdf") {
            return Err(Error::Validation("Only PDF files are accepted".into()));
        }
        if bytes.is_empty() {
            return Err(Error::Validation("Uploaded file is empty".into()));
        }
        let limit = self.config.max_upload_bytes;
        if bytes.len() as u64 > limit {
            return Err(Error::Validation(format!(
                "File too large: {} bytes exceeds the {} MiB limit",
                bytes.len(),
                limit / (1024 * 1024)
            )));
        }

        let category = sanitize_category(category.unwrap_or(DEFAULT_CATEGORY));
        let base = sanitize_filename(original_name);
        let now = Utc::now();
        let mut filename = base.clone();
        let mut paper_id = mint_paper_id(&category, &filename, now);
        let mut n = 2;
        while self.store.exists(&paper_id).await {
            filename = with_suffix(&base, n);
            paper_id = mint_paper_id(&category, &filename, now);
            n += 1;
        }

        let info = self
            .store
            .put_source(&paper_id, bytes, &category, original_name)
            .await?;
        let mut meta = PaperMetadata::new(&paper_id, &category, original_name, &filename, info.size);
        meta.upload_time = now;
        meta.updated_at = now;
        meta.content_hash = Some(info.content_hash.clone());
        if let Err(e) = self.store.put_metadata(&meta).await {
            warn!("Metadata write failed for {}, discarding source: {}", paper_id, e);
            self.store.discard_source(&paper_id, &category).await;
            return Err(e);
        }

        info!("Uploaded {} ({} bytes) as {}", original_name, info.size, paper_id);
        Ok(UploadRecord {
            paper_id,
            filename,
            original_filename: original_name.to_string(),
            category,
            size: info.size,
            upload_time: now,
            content_hash: info.content_hash,
        })
    }

    async fn source_path(&self, paper_id: &str) -> Result<PathBuf> {
        self.store.get_metadata(paper_id).await?;
        self.store.locate(paper_id, ArtifactKind::Source).await
    }

    /// Run a workflow to completion under a new task.
    pub async fn process(
        &self,
        paper_id: &str,
        workflow: Workflow,
        options: WorkflowOptions,
    ) -> Result<ProcessOutcome> {
        let source_path = self.source_path(paper_id).await?;
        let task = self.registry.create(
            paper_id,
            workflow.as_str(),
            serde_json::to_value(&options).unwrap_or_default(),
        );

        let result = run_tracked(
            &self.engine,
            &task.task_id,
            WorkflowRequest {
                paper_id: paper_id.to_string(),
                source_path,
                workflow,
                options,
                task_id: Some(task.task_id.clone()),
            },
        )
        .await;

        if !result.success {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| format!("{} failed", workflow));
            return Err(Error::Capability(message));
        }

        let status = self
            .registry
            .get(&task.task_id)
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Completed);
        Ok(ProcessOutcome {
            task_id: task.task_id,
            paper_id: paper_id.to_string(),
            workflow,
            status,
            result: Some(result),
        })
    }

    /// Start a workflow on a detached task and return the pending task at once.
    pub async fn submit(
        &self,
        paper_id: &str,
        workflow: Workflow,
        options: WorkflowOptions,
    ) -> Result<ProcessOutcome> {
        let source_path = self.source_path(paper_id).await?;
        let task = self.registry.create(
            paper_id,
            workflow.as_str(),
            serde_json::to_value(&options).unwrap_or_default(),
        );

        let engine = self.engine.clone();
        let request = WorkflowRequest {
            paper_id: paper_id.to_string(),
            source_path,
            workflow,
            options,
            task_id: Some(task.task_id.clone()),
        };
        let task_id = task.task_id.clone();
        tokio::spawn(async move {
            run_tracked(&engine, &task_id, request).await;
        });

        debug!("Submitted {} on {} as task {}", workflow, paper_id, task.task_id);
        Ok(ProcessOutcome {
            task_id: task.task_id,
            paper_id: paper_id.to_string(),
            workflow,
            status: task.status,
            result: None,
        })
    }

    pub async fn get_status(&self, paper_id: &str) -> Result<PaperMetadata> {
        self.store.get_metadata(paper_id).await
    }

    pub async fn get_content(&self, paper_id: &str, kind: ContentKind) -> Result<ContentView> {
        self.store.get_metadata(paper_id).await?;
        let artifact = kind.artifact();
        let path = self.store.locate(paper_id, artifact).await?;
        let file_path = path.display().to_string();

        match kind {
            ContentKind::Source => {
                let size = tokio::fs::metadata(&path).await?.len();
                Ok(ContentView {
                    paper_id: paper_id.to_string(),
                    content_type: kind,
                    format: "pdf",
                    file_path,
                    size: Some(size),
                    content: None,
                    word_count: None,
                })
            }
            ContentKind::Translation | ContentKind::Heartfelt => {
                let content = self.store.get_text(paper_id, artifact).await?;
                Ok(ContentView {
                    paper_id: paper_id.to_string(),
                    content_type: kind,
                    format: "markdown",
                    file_path,
                    size: Some(content.len() as u64),
                    word_count: Some(deepread_ingest::word_count(&content)),
                    content: Some(content),
                })
            }
        }
    }

    /// Stored source bytes with the paper record, for download.
    pub async fn source_bytes(&self, paper_id: &str) -> Result<(PaperMetadata, Vec<u8>)> {
        let meta = self.store.get_metadata(paper_id).await?;
        match self.store.get(paper_id, ArtifactKind::Source).await? {
            Artifact::Bytes(bytes) => Ok((meta, bytes)),
            _ => Err(Error::Internal("source artifact is not binary".into())),
        }
    }

    pub async fn list(
        &self,
        filter: &PaperFilter,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<PaperMetadata>, usize)> {
        self.store.list(filter, offset, limit).await
    }

    pub async fn delete(&self, paper_id: &str) -> Result<DeleteOutcome> {
        self.store.delete(paper_id).await
    }

    /// Run a workflow over stored papers. Unknown ids are reported as invalid.
    pub async fn batch(
        &self,
        paper_ids: Vec<String>,
        workflow: Workflow,
        options: BatchOptions,
    ) -> Result<BatchReport> {
        if paper_ids.is_empty() {
            return Err(Error::Validation("No paper ids provided".into()));
        }
        let max = self.config.max_batch_papers;
        if paper_ids.len() > max {
            return Err(Error::Validation(format!(
                "Too many papers in one batch: {} (max {})",
                paper_ids.len(),
                max
            )));
        }

        let total_requested = paper_ids.len();
        let mut items = Vec::with_capacity(paper_ids.len());
        let mut missing = Vec::new();
        for paper_id in paper_ids {
            match self.source_path(&paper_id).await {
                Ok(path) => items.push(BatchItem::stored(paper_id, path)),
                Err(e) => missing.push(InvalidItem {
                    path: paper_id,
                    reason: e.to_string(),
                }),
            }
        }

        let mut report = self.batch.run(items, workflow, options).await;
        report.total_requested = total_requested;
        missing.append(&mut report.invalid);
        report.invalid = missing;
        Ok(report)
    }

    /// Import and process local files.
    pub async fn batch_files(
        &self,
        paths: Vec<PathBuf>,
        workflow: Workflow,
        options: BatchOptions,
    ) -> BatchReport {
        let items = paths.into_iter().map(BatchItem::file).collect();
        self.batch.run(items, workflow, options).await
    }

    /// Return the stored report, rendering it from the analysis tree if needed.
    pub async fn get_report(&self, paper_id: &str) -> Result<ReportView> {
        let meta = self.store.get_metadata(paper_id).await?;

        match self.store.get_text(paper_id, ArtifactKind::Report).await {
            Ok(content) => {
                let path = self.store.locate(paper_id, ArtifactKind::Report).await?;
                return Ok(ReportView {
                    paper_id: paper_id.to_string(),
                    content,
                    file_path: path.display().to_string(),
                    generated: false,
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let tree = match self.store.get(paper_id, ArtifactKind::AnalysisStructured).await {
            Ok(Artifact::Tree(value)) => serde_json::from_value::<AnalysisTree>(value)?,
            Ok(_) => return Err(Error::Internal("analysis tree is not structured".into())),
            Err(e) if e.is_not_found() => {
                return Err(Error::ArtifactNotFound {
                    paper_id: paper_id.to_string(),
                    kind: ArtifactKind::Report.as_str().to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        let content = render_report(Some(&meta), paper_id, &tree);
        let path = self
            .store
            .put_text(paper_id, ArtifactKind::Report, &content)
            .await?;
        info!("Generated report for {}", paper_id);
        Ok(ReportView {
            paper_id: paper_id.to_string(),
            content,
            file_path: path.display().to_string(),
            generated: true,
        })
    }

    pub async fn translate(&self, paper_id: &str) -> Result<ProcessOutcome> {
        self.process(paper_id, Workflow::TranslateOnly, WorkflowOptions::default())
            .await
    }

    pub async fn analyze(&self, paper_id: &str) -> Result<ProcessOutcome> {
        self.process(paper_id, Workflow::HeartfeltOnly, WorkflowOptions::default())
            .await
    }

    // ---------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.registry.require(task_id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter, offset: usize, limit: usize) -> (Vec<Task>, usize) {
        self.registry.list(filter, offset, limit)
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<CancelOutcome> {
        self.registry.cancel(task_id)
    }

    pub fn task_logs(&self, task_id: &str, lines: usize) -> Result<Vec<String>> {
        self.registry.get_logs(task_id, lines)
    }

    pub fn cleanup_tasks(&self, older_than_hours: i64) -> Result<CleanupOutcome> {
        if older_than_hours < 0 {
            return Err(Error::Validation("older_than_hours must not be negative".into()));
        }
        let cutoff_time = chrono::TimeDelta::try_hours(older_than_hours)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                Error::Validation(format!("older_than_hours out of range: {}", older_than_hours))
            })?;
        let cleaned = self.registry.gc(cutoff_time);
        Ok(CleanupOutcome {
            cleaned,
            cutoff_time,
        })
    }

    pub fn task_stats(&self) -> TaskStats {
        self.registry.stats()
    }
}

/// Drive one workflow under `task_id` and settle the task.
async fn run_tracked(engine: &WorkflowEngine, task_id: &str, request: WorkflowRequest) -> WorkflowResult {
    let registry = engine.registry();
    registry.update(
        task_id,
        TaskUpdate::status(TaskStatus::Processing)
            .progress(5)
            .message(format!("Starting {}", request.workflow)),
    );

    let result = engine.run(request).await;

    let update = if result.success {
        TaskUpdate::status(TaskStatus::Completed)
            .message("Completed")
            .result(serde_json::to_value(&result).unwrap_or_default())
    } else {
        TaskUpdate::status(TaskStatus::Failed)
            .message("Failed")
            .error(result.error.clone().unwrap_or_else(|| "workflow failed".into()))
    };
    if registry.update(task_id, update).is_none() {
        debug!("Task {} was already settled; workflow outcome dropped", task_id);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::testing::*;
    use deepread_store::PaperStatus;
    use std::time::Duration;

    struct Setup {
        _dir: tempfile::TempDir,
        orch: Orchestrator,
        extract: Arc<StubExtract>,
    }

    fn setup_with(configure: impl FnOnce(&mut DeepReadConfig)) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DeepReadConfig::with_defaults(dir.path()).unwrap();
        configure(&mut config);
        let extract = Arc::new(StubExtract::new("# Title\n\nBody text."));
        let orch = Orchestrator::new(config, stub_invoker(extract.clone()));
        Setup {
            _dir: dir,
            orch,
            extract,
        }
    }

    fn setup() -> Setup {
        setup_with(|_| {})
    }

    fn pdf_bytes(len: usize) -> Vec<u8> {
        let mut bytes = b"%PDF-1.4\n".to_vec();
        bytes.resize(len, b' ');
        bytes
    }

    #[tokio::test]
    async fn test_upload_and_extract_happy_path() {
        let s = setup();
        let record = s
            .orch
            .upload(&pdf_bytes(4096), "My Paper.pdf", Some("llm-agents"))
            .await
            .unwrap();
        assert!(record.paper_id.starts_with("llm-agents_"));
        assert!(record.paper_id.ends_with("_My_Paper.pdf"));
        assert_eq!(record.size, 4096);

        let meta = s.orch.get_status(&record.paper_id).await.unwrap();
        assert_eq!(meta.status, PaperStatus::Uploaded);
        assert!(meta.workflows.is_empty());

        let outcome = s
            .orch
            .process(&record.paper_id, Workflow::ExtractOnly, WorkflowOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(s.orch.get_task(&outcome.task_id).unwrap().progress, 100);

        let err = s
            .orch
            .get_content(&record.paper_id, ContentKind::Translation)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_upload_rejections_leave_no_trace() {
        let s = setup_with(|c| c.max_upload_bytes = 1024);
        let err = s.orch.upload(&pdf_bytes(2048), "big.pdf", None).await.unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().starts_with("File too large"));

        let err = s.orch.upload(&pdf_bytes(10), "notes.txt", None).await.unwrap_err();
        assert!(err.is_validation());

        let (papers, total) = s.orch.list(&PaperFilter::default(), 0, 100).await.unwrap();
        assert!(papers.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_source_round_trip_and_content_view() {
        let s = setup();
        let bytes = pdf_bytes(777);
        let record = s.orch.upload(&bytes, "a.pdf", None).await.unwrap();
        assert!(record.paper_id.starts_with("general_"));

        let (_, stored) = s.orch.source_bytes(&record.paper_id).await.unwrap();
        assert_eq!(stored, bytes);

        let view = s
            .orch
            .get_content(&record.paper_id, ContentKind::Source)
            .await
            .unwrap();
        assert_eq!(view.format, "pdf");
        assert_eq!(view.size, Some(777));
        assert!(view.content.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_upload_gets_suffix() {
        let s = setup();
        let a = s.orch.upload(&pdf_bytes(100), "same.pdf", Some("nlp")).await.unwrap();
        let b = s.orch.upload(&pdf_bytes(100), "same.pdf", Some("nlp")).await.unwrap();
        assert_ne!(a.paper_id, b.paper_id);
    }

    #[tokio::test]
    async fn test_translate_shortcut_and_markdown_content() {
        let s = setup();
        let record = s.orch.upload(&pdf_bytes(100), "t.pdf", None).await.unwrap();
        s.orch.translate(&record.paper_id).await.unwrap();
        let view = s
            .orch
            .get_content(&record.paper_id, ContentKind::Translation)
            .await
            .unwrap();
        assert_eq!(view.format, "markdown");
        assert!(view.content.unwrap().starts_with("[zh] # Title"));
        assert!(view.word_count.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_process_missing_paper() {
        let s = setup();
        let err = s
            .orch
            .process("general_x_missing.pdf", Workflow::Full, WorkflowOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PaperNotFound(_)));
        assert_eq!(s.orch.task_stats().total, 0);
    }

    #[tokio::test]
    async fn test_process_failure_marks_task_failed() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeepReadConfig::with_defaults(dir.path()).unwrap();
        let orch = Orchestrator::new(
            config,
            stub_invoker(Arc::new(StubExtract::new("x").failing_first(1))),
        );
        let record = orch.upload(&pdf_bytes(100), "f.pdf", None).await.unwrap();
        let err = orch
            .process(&record.paper_id, Workflow::ExtractOnly, WorkflowOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Capability(_)));

        let (tasks, _) = orch.list_tasks(&TaskFilter::default(), 0, 10);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error.is_some());
        let meta = orch.get_status(&record.paper_id).await.unwrap();
        assert_eq!(meta.status, PaperStatus::Failed);
    }

    #[tokio::test]
    async fn test_delete_cascade() {
        let s = setup();
        let record = s.orch.upload(&pdf_bytes(100), "d.pdf", None).await.unwrap();
        s.orch.analyze(&record.paper_id).await.unwrap();

        let outcome = s.orch.delete(&record.paper_id).await.unwrap();
        assert!(outcome.deleted);
        assert!(matches!(
            s.orch.get_status(&record.paper_id).await.unwrap_err(),
            Error::PaperNotFound(_)
        ));
        assert!(s.orch.delete(&record.paper_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_report_retrieved_or_regenerated() {
        let s = setup();
        let record = s.orch.upload(&pdf_bytes(100), "r.pdf", None).await.unwrap();
        assert!(s.orch.get_report(&record.paper_id).await.unwrap_err().is_not_found());

        s.orch.analyze(&record.paper_id).await.unwrap();
        let stored = s.orch.get_report(&record.paper_id).await.unwrap();
        assert!(!stored.generated);

        std::fs::remove_file(&stored.file_path).unwrap();
        let regenerated = s.orch.get_report(&record.paper_id).await.unwrap();
        assert!(regenerated.generated);
        assert!(regenerated.content.contains("First point"));
    }

    #[tokio::test]
    async fn test_batch_limits_and_unknown_ids() {
        let s = setup();
        let too_many = (0..51).map(|i| format!("general_{}", i)).collect();
        assert!(s
            .orch
            .batch(too_many, Workflow::ExtractOnly, BatchOptions::default())
            .await
            .unwrap_err()
            .is_validation());
        assert!(s
            .orch
            .batch(Vec::new(), Workflow::ExtractOnly, BatchOptions::default())
            .await
            .unwrap_err()
            .is_validation());

        let record = s.orch.upload(&pdf_bytes(100), "b.pdf", None).await.unwrap();
        let report = s
            .orch
            .batch(
                vec![record.paper_id.clone(), "general_nope.pdf".into()],
                Workflow::ExtractOnly,
                BatchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.total_requested, 2);
        assert_eq!(report.total_files, 1);
        assert_eq!(report.stats.successful, 1);
        assert_eq!(report.invalid[0].path, "general_nope.pdf");
        assert_eq!(report.results[0].paper_id, record.paper_id);
        assert_eq!(s.extract.calls(), 1);
    }

    #[tokio::test]
    async fn test_submit_returns_pending_then_completes() {
        let s = setup();
        let record = s.orch.upload(&pdf_bytes(100), "s.pdf", None).await.unwrap();
        let mut rx = s.orch.bus().subscribe();
        let outcome = s
            .orch
            .submit(&record.paper_id, Workflow::ExtractOnly, WorkflowOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Pending);
        assert!(outcome.result.is_none());

        let success = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(Event::TaskCompleted { task_id, success, .. }) = rx.recv().await {
                    if task_id == outcome.task_id {
                        break success;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert!(success);
    }

    #[tokio::test]
    async fn test_cancel_then_late_completion_is_ignored() {
        let s = setup();
        let task = s.orch.registry().create("p", "full", serde_json::json!({}));
        s.orch
            .registry()
            .update(&task.task_id, TaskUpdate::status(TaskStatus::Processing).progress(50));
        let cancelled = s.orch.cancel_task(&task.task_id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        s.orch
            .registry()
            .update(&task.task_id, TaskUpdate::status(TaskStatus::Completed));
        assert_eq!(s.orch.get_task(&task.task_id).unwrap().status, TaskStatus::Cancelled);
        assert!(s.orch.cancel_task("missing").unwrap_err().is_not_found());

        let cleanup = s.orch.cleanup_tasks(0).unwrap();
        assert!(cleanup.cutoff_time <= Utc::now());
    }

    #[tokio::test]
    async fn test_cleanup_rejects_out_of_range_age() {
        let s = setup();
        assert!(s.orch.cleanup_tasks(1_000_000_000_000).unwrap_err().is_validation());
        assert!(s.orch.cleanup_tasks(i64::MAX).unwrap_err().is_validation());
        assert!(s.orch.cleanup_tasks(-1).unwrap_err().is_validation());
        assert_eq!(s.orch.cleanup_tasks(24 * 365).unwrap().cleaned, 0);
    }
}
