//! Workflow engine: composes extract, translate and analyze over one paper.
//!
//! | workflow         | stages                          | success          |
//! |------------------|---------------------------------|------------------|
//! | `extract_only`   | extract                         | extract          |
//! | `translate_only` | extract → translate             | translate        |
//! | `heartfelt_only` | extract → analyze               | analyze          |
//! | `full`           | extract → translate, analyze detached | translate  |
//!
//! Stages run strictly in order. The first failing stage ends the run; its
//! error becomes the workflow error and later stages are skipped. Each stage
//! writes its own artifact kinds, so re-running a workflow overwrites them.
//!
//! The engine reports progress on the caller's task but never moves it to a
//! terminal state; that belongs to whoever created the task.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use deepread_core::{AnalysisOutput, ArtifactKind, Error, ExtractOptions, ExtractedDocument};
use deepread_ingest::segment::{reassemble, Segmenter};
use deepread_store::{ArtifactStore, PaperStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::invoker::{CapabilityError, CapabilityErrorKind, CapabilityKind, CapabilityParams, Invoker};
use crate::registry::{TaskRegistry, TaskStatus, TaskUpdate};
use crate::report::render_report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Full,
    ExtractOnly,
    TranslateOnly,
    HeartfeltOnly,
}

impl Workflow {
    pub const ALL: [Workflow; 4] = [
        Workflow::Full,
        Workflow::ExtractOnly,
        Workflow::TranslateOnly,
        Workflow::HeartfeltOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::ExtractOnly => "extract_only",
            Self::TranslateOnly => "translate_only",
            Self::HeartfeltOnly => "heartfelt_only",
        }
    }

    fn translates(&self) -> bool {
        matches!(self, Self::Full | Self::TranslateOnly)
    }
}

impl std::fmt::Display for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Workflow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.as_str() == s)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Unknown workflow '{}': expected full, extract_only, translate_only or heartfelt_only",
                    s
                ))
            })
    }
}

/// Per-run stage options. Unset fields fall back to the engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOptions {
    #[serde(default)]
    pub extract: ExtractOptions,
    #[serde(default)]
    pub target_language: Option<String>,
    #[serde(default)]
    pub translate_batch_chars: Option<usize>,
}

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: CapabilityKind,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<CapabilityErrorKind>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub paper_id: String,
    pub workflow: Workflow,
    pub success: bool,
    pub stages: Vec<StageOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<CapabilityErrorKind>,
    /// Task tracking the detached analysis of a `full` run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_task_id: Option<String>,
    /// Artifact kind → written path.
    pub artifacts: BTreeMap<String, String>,
}

impl WorkflowResult {
    fn new(paper_id: &str, workflow: Workflow) -> Self {
        Self {
            paper_id: paper_id.to_string(),
            workflow,
            success: false,
            stages: Vec::new(),
            error: None,
            error_kind: None,
            analysis_task_id: None,
            artifacts: BTreeMap::new(),
        }
    }

    fn fail(&mut self, stage: CapabilityKind, err: StageError) {
        self.error = Some(err.message.clone());
        self.error_kind = err.kind;
        self.stages.push(StageOutcome {
            stage,
            success: false,
            error: Some(err.message),
            error_kind: err.kind,
            details: serde_json::Value::Null,
        });
    }

    fn pass(&mut self, stage: CapabilityKind, details: serde_json::Value) {
        self.stages.push(StageOutcome {
            stage,
            success: true,
            error: None,
            error_kind: None,
            details,
        });
    }

    fn record(&mut self, kind: ArtifactKind, path: PathBuf) {
        self.artifacts
            .insert(kind.as_str().to_string(), path.display().to_string());
    }
}

/// One workflow execution request.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub paper_id: String,
    pub source_path: PathBuf,
    pub workflow: Workflow,
    pub options: WorkflowOptions,
    /// Task that receives progress updates.
    pub task_id: Option<String>,
}

/// Stage failure: a capability error or a store error.
#[derive(Debug)]
struct StageError {
    message: String,
    kind: Option<CapabilityErrorKind>,
}

impl From<CapabilityError> for StageError {
    fn from(e: CapabilityError) -> Self {
        Self {
            message: e.message,
            kind: Some(e.kind),
        }
    }
}

impl From<Error> for StageError {
    fn from(e: Error) -> Self {
        Self {
            message: e.to_string(),
            kind: None,
        }
    }
}

type StageResult<T> = std::result::Result<T, StageError>;

#[derive(Clone)]
pub struct WorkflowEngine {
    invoker: Invoker,
    store: Arc<ArtifactStore>,
    registry: Arc<TaskRegistry>,
    target_language: String,
    translate_batch_chars: usize,
}

impl WorkflowEngine {
    pub fn new(
        invoker: Invoker,
        store: Arc<ArtifactStore>,
        registry: Arc<TaskRegistry>,
        target_language: impl Into<String>,
        translate_batch_chars: usize,
    ) -> Self {
        Self {
            invoker,
            store,
            registry,
            target_language: target_language.into(),
            translate_batch_chars,
        }
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    fn progress(&self, task_id: Option<&str>, progress: i64, message: &str) {
        if let Some(id) = task_id {
            self.registry.update(
                id,
                TaskUpdate::status(TaskStatus::Processing)
                    .progress(progress)
                    .message(message),
            );
        }
    }

    async fn mark(&self, paper_id: &str, workflow: &str, status: PaperStatus, error: Option<String>) {
        match self
            .store
            .set_workflow_status(paper_id, workflow, status, error)
            .await
        {
            Ok(_) => {}
            Err(Error::PaperNotFound(_)) => debug!("No metadata for {}, status not recorded", paper_id),
            Err(e) => warn!("Failed to record {} status for {}: {}", workflow, paper_id, e),
        }
    }

    /// Run one workflow to completion (the detached analysis of `full` excepted).
    pub async fn run(&self, request: WorkflowRequest) -> WorkflowResult {
        let WorkflowRequest {
            paper_id,
            source_path,
            workflow,
            options,
            task_id,
        } = request;
        let task_id = task_id.as_deref();
        let mut result = WorkflowResult::new(&paper_id, workflow);

        info!("Running {} on {}", workflow, paper_id);
        self.mark(&paper_id, workflow.as_str(), PaperStatus::Processing, None)
            .await;

        // Stage 1: extract
        self.progress(task_id, 10, "Extracting content");
        let document = match self.extract(&paper_id, &source_path, &options, &mut result).await {
            Ok(doc) => doc,
            Err(e) => return self.finish_failed(result, CapabilityKind::Extract, e).await,
        };
        self.progress(task_id, 35, "Extraction complete");

        // Stage 2: translate
        let mut translation = None;
        if workflow.translates() {
            self.progress(task_id, 40, "Translating");
            match self
                .translate(&paper_id, &document.markdown, &options, &mut result)
                .await
            {
                Ok(text) => translation = Some(text),
                Err(e) => return self.finish_failed(result, CapabilityKind::Translate, e).await,
            }
            self.progress(task_id, 80, "Translation complete");
        }

        // Stage 3: analyze
        match workflow {
            Workflow::HeartfeltOnly => {
                self.progress(task_id, 50, "Analyzing");
                if let Err(e) = self
                    .analyze(&paper_id, &document.markdown, None, &mut result)
                    .await
                {
                    return self.finish_failed(result, CapabilityKind::Analyze, e).await;
                }
                self.progress(task_id, 90, "Analysis complete");
            }
            Workflow::Full => {
                result.analysis_task_id =
                    Some(self.spawn_analysis(&paper_id, document.markdown, translation, task_id));
            }
            Workflow::ExtractOnly | Workflow::TranslateOnly => {}
        }

        result.success = true;
        self.mark(&paper_id, workflow.as_str(), PaperStatus::Completed, None)
            .await;
        info!("Workflow {} on {} succeeded", workflow, paper_id);
        result
    }

    async fn finish_failed(
        &self,
        mut result: WorkflowResult,
        stage: CapabilityKind,
        err: StageError,
    ) -> WorkflowResult {
        error!(
            "Workflow {} on {} failed at {}: {}",
            result.workflow, result.paper_id, stage, err.message
        );
        let message = format!("{} failed: {}", stage, err.message);
        result.fail(stage, err);
        self.mark(
            &result.paper_id,
            result.workflow.as_str(),
            PaperStatus::Failed,
            Some(message),
        )
        .await;
        result
    }

    async fn extract(
        &self,
        paper_id: &str,
        source: &std::path::Path,
        options: &WorkflowOptions,
        result: &mut WorkflowResult,
    ) -> StageResult<ExtractedDocument> {
        let document = self
            .invoker
            .invoke(CapabilityParams::Extract {
                source: source.to_path_buf(),
                options: options.extract,
            })
            .await?
            .into_extracted()?;

        let path = self
            .store
            .put_text(paper_id, ArtifactKind::Extract, &document.markdown)
            .await?;
        result.record(ArtifactKind::Extract, path);

        let summary = document.summary();
        let mut patch = serde_json::Map::new();
        patch.insert("extract".into(), summary.clone());
        if let Err(e) = self.store.update_metadata(paper_id, patch).await {
            debug!("Extract summary not recorded for {}: {}", paper_id, e);
        }

        result.pass(CapabilityKind::Extract, summary);
        Ok(document)
    }

    async fn translate(
        &self,
        paper_id: &str,
        body: &str,
        options: &WorkflowOptions,
        result: &mut WorkflowResult,
    ) -> StageResult<String> {
        let language = options
            .target_language
            .clone()
            .unwrap_or_else(|| self.target_language.clone());
        let limit = options
            .translate_batch_chars
            .unwrap_or(self.translate_batch_chars);
        let segments = Segmenter::new(limit).split(body);
        debug!("Translating {} in {} segment(s)", paper_id, segments.len());

        let calls = segments
            .iter()
            .map(|s| CapabilityParams::Translate {
                text: s.text.clone(),
                target_language: language.clone(),
            })
            .collect::<Vec<_>>();
        let outputs = match <[CapabilityParams; 1]>::try_from(calls) {
            Ok([single]) => vec![self.invoker.invoke(single).await],
            Err(calls) => self.invoker.batch_invoke(calls).await,
        };

        let mut rendered = Vec::with_capacity(outputs.len());
        for (i, output) in outputs.into_iter().enumerate() {
            match output.and_then(|o| o.into_translated()) {
                Ok(text) => rendered.push(text),
                Err(e) => {
                    return Err(StageError {
                        message: format!("segment {}/{}: {}", i + 1, segments.len(), e.message),
                        kind: Some(e.kind),
                    })
                }
            }
        }
        let translation = reassemble(&segments, &rendered);

        let path = self
            .store
            .put_text(paper_id, ArtifactKind::Translation, &translation)
            .await?;
        result.record(ArtifactKind::Translation, path);
        result.pass(
            CapabilityKind::Translate,
            serde_json::json!({
                "segments": segments.len(),
                "target_language": language,
                "char_count": translation.chars().count(),
            }),
        );
        Ok(translation)
    }

    async fn analyze(
        &self,
        paper_id: &str,
        body: &str,
        translation: Option<String>,
        result: &mut WorkflowResult,
    ) -> StageResult<AnalysisOutput> {
        let output = self
            .invoker
            .invoke(CapabilityParams::Analyze {
                text: body.to_string(),
                translation,
            })
            .await?
            .into_analyzed()?;

        let path = self
            .store
            .put_text(paper_id, ArtifactKind::Analysis, &output.markdown)
            .await?;
        result.record(ArtifactKind::Analysis, path);

        let tree = serde_json::to_value(&output.tree).map_err(Error::from)?;
        let path = self
            .store
            .put_structured(paper_id, ArtifactKind::AnalysisStructured, &tree)
            .await?;
        result.record(ArtifactKind::AnalysisStructured, path);

        let meta = self.store.get_metadata(paper_id).await.ok();
        let report = render_report(meta.as_ref(), paper_id, &output.tree);
        let path = self
            .store
            .put_text(paper_id, ArtifactKind::Report, &report)
            .await?;
        result.record(ArtifactKind::Report, path);

        result.pass(
            CapabilityKind::Analyze,
            serde_json::to_value(&output.tree.stats).map_err(Error::from)?,
        );
        Ok(output)
    }

    /// Fire-and-forget analysis for `full`. Its outcome reaches subscribers
    /// through the task it is tracked under; the caller never awaits it.
    fn spawn_analysis(
        &self,
        paper_id: &str,
        body: String,
        translation: Option<String>,
        parent_task: Option<&str>,
    ) -> String {
        let task = self.registry.create(
            paper_id,
            "full_analyze",
            serde_json::json!({ "parent_task_id": parent_task }),
        );
        let task_id = task.task_id.clone();
        debug!("Spawning background analysis of {} as task {}", paper_id, task_id);
        let engine = self.clone();
        let paper_id = paper_id.to_string();

        tokio::spawn({
            let task_id = task_id.clone();
            async move {
                engine.registry.update(
                    &task_id,
                    TaskUpdate::status(TaskStatus::Processing)
                        .progress(10)
                        .message("Analyzing"),
                );
                engine
                    .mark(&paper_id, "full_analyze", PaperStatus::Processing, None)
                    .await;

                let mut result = WorkflowResult::new(&paper_id, Workflow::Full);
                match engine.analyze(&paper_id, &body, translation, &mut result).await {
                    Ok(_) => {
                        result.success = true;
                        let value = serde_json::to_value(&result).unwrap_or_default();
                        engine.registry.update(
                            &task_id,
                            TaskUpdate::status(TaskStatus::Completed)
                                .message("Analysis complete")
                                .result(value),
                        );
                        engine
                            .mark(&paper_id, "full_analyze", PaperStatus::Completed, None)
                            .await;
                        info!("Background analysis of {} finished", paper_id);
                    }
                    Err(e) => {
                        error!("Background analysis of {} failed: {}", paper_id, e.message);
                        engine.registry.update(
                            &task_id,
                            TaskUpdate::status(TaskStatus::Failed)
                                .message("Analysis failed")
                                .error(e.message.clone()),
                        );
                        engine
                            .mark(
                                &paper_id,
                                "full_analyze",
                                PaperStatus::Failed,
                                Some(format!("analyze failed: {}", e.message)),
                            )
                            .await;
                    }
                }
            }
        });
        task_id
    }
}
