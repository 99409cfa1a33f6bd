//! Batch controller: many workflow runs under bounded parallelism.
//!
//! Items are validated, split into batches of `batch_size`, and each batch runs
//! concurrently. A single semaphore of width `parallel_tasks` is shared by the
//! whole run, and every attempt holds a permit, so the ceiling holds across
//! batch boundaries. A failed item is retried up to `failed_retry` more times,
//! sleeping `backoff_base * 2^attempt` between attempts. Item failures never
//! abort the batch. A `batch_progress` event follows every batch.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deepread_core::paper::{infer_category, mint_paper_id, sanitize_filename, with_suffix};
use deepread_core::{BatchDefaults, Result};
use deepread_store::PaperMetadata;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::events::{Event, EventBus};
use crate::invoker::CapabilityErrorKind;
use crate::registry::{TaskStatus, TaskUpdate};
use crate::workflow::{Workflow, WorkflowEngine, WorkflowOptions, WorkflowRequest, WorkflowResult};

/// A document to process. Items without a `paper_id` are imported into the
/// store under a freshly minted id before their workflow runs.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub path: PathBuf,
    pub paper_id: Option<String>,
}

impl BatchItem {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            paper_id: None,
        }
    }

    pub fn stored(paper_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            paper_id: Some(paper_id.into()),
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Per-run options; unset sizes fall back to the configured defaults.
#[derive(Clone)]
pub struct BatchOptions {
    pub batch_size: Option<usize>,
    pub parallel_tasks: Option<usize>,
    pub failed_retry: Option<u32>,
    pub backoff_base: Duration,
    pub progress_callback: Option<ProgressCallback>,
    pub workflow_options: WorkflowOptions,
    /// Create a registry task per item.
    pub track_tasks: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            parallel_tasks: None,
            failed_retry: None,
            backoff_base: Duration::from_secs(1),
            progress_callback: None,
            workflow_options: WorkflowOptions::default(),
            track_tasks: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidItem {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub path: String,
    pub paper_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub success: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<CapabilityErrorKind>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkflowResult>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowCount {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub duration_secs: f64,
    /// Items per second of wall-clock time.
    pub throughput: f64,
    pub by_workflow: BTreeMap<String, WorkflowCount>,
}

impl BatchStats {
    fn aggregate(results: &[ItemResult], workflow: Workflow, elapsed: Duration) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let failed = total - successful;
        let duration_secs = elapsed.as_secs_f64();
        let mut by_workflow = BTreeMap::new();
        if total > 0 {
            by_workflow.insert(
                workflow.as_str().to_string(),
                WorkflowCount {
                    total,
                    successful,
                    failed,
                },
            );
        }
        Self {
            total,
            successful,
            failed,
            success_rate: if total == 0 { 0.0 } else { successful as f64 / total as f64 },
            duration_secs,
            throughput: if duration_secs > 0.0 { total as f64 / duration_secs } else { 0.0 },
            by_workflow,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub workflow: Workflow,
    pub total_requested: usize,
    pub total_files: usize,
    pub invalid: Vec<InvalidItem>,
    pub results: Vec<ItemResult>,
    pub stats: BatchStats,
}

/// An item that passed validation and has a paper id and stored source.
#[derive(Debug, Clone)]
struct Prepared {
    label: String,
    paper_id: String,
    source: PathBuf,
}

/// Settings shared by every item task of one run.
#[derive(Clone)]
struct RunContext {
    engine: WorkflowEngine,
    workflow: Workflow,
    options: WorkflowOptions,
    semaphore: Arc<Semaphore>,
    max_attempts: u32,
    backoff_base: Duration,
    track_tasks: bool,
}

#[derive(Clone)]
pub struct BatchController {
    engine: WorkflowEngine,
    bus: Arc<EventBus>,
    defaults: BatchDefaults,
    categories: Vec<String>,
}

impl BatchController {
    pub fn new(
        engine: WorkflowEngine,
        bus: Arc<EventBus>,
        defaults: BatchDefaults,
        categories: Vec<String>,
    ) -> Self {
        Self {
            engine,
            bus,
            defaults,
            categories,
        }
    }

    pub fn defaults(&self) -> BatchDefaults {
        self.defaults
    }

    pub async fn run(&self, items: Vec<BatchItem>, workflow: Workflow, options: BatchOptions) -> BatchReport {
        let started = Instant::now();
        let batch_id = uuid::Uuid::new_v4().to_string();
        let total_requested = items.len();
        let batch_size = options.batch_size.unwrap_or(self.defaults.batch_size).max(1);
        let parallel = options
            .parallel_tasks
            .unwrap_or(self.defaults.parallel_tasks)
            .max(1);
        let retries = options.failed_retry.unwrap_or(self.defaults.failed_retry);

        // 1. Validate
        let mut invalid = Vec::new();
        let mut valid = Vec::new();
        for item in items {
            match validate(&item.path).await {
                Ok(()) => valid.push(item),
                Err(reason) => {
                    warn!("Skipping {}: {}", item.path.display(), reason);
                    invalid.push(InvalidItem {
                        path: item.path.display().to_string(),
                        reason,
                    });
                }
            }
        }

        // Mint ids and import sources for loose files.
        let mut prepared = Vec::with_capacity(valid.len());
        let mut results = Vec::new();
        let mut taken = HashSet::new();
        let minted_at = Utc::now();
        for item in valid {
            match self.prepare(item, minted_at, &mut taken).await {
                Ok(p) => prepared.push(p),
                Err(failed) => results.push(failed),
            }
        }

        let total = prepared.len() + results.len();
        let total_batches = prepared.len().div_ceil(batch_size);
        info!(
            "Batch {}: {} valid of {} requested, {} batch(es), parallel={}, retries={}",
            batch_id, total, total_requested, total_batches, parallel, retries
        );

        let ctx = RunContext {
            engine: self.engine.clone(),
            workflow,
            options: options.workflow_options.clone(),
            semaphore: Arc::new(Semaphore::new(parallel)),
            max_attempts: retries + 1,
            backoff_base: options.backoff_base,
            track_tasks: options.track_tasks,
        };

        // 2-4. Partition, run, emit
        let mut processed = results.len();
        for (index, chunk) in prepared.chunks(batch_size).enumerate() {
            let handles: Vec<_> = chunk
                .iter()
                .cloned()
                .map(|item| {
                    let ctx = ctx.clone();
                    let fallback = item.clone();
                    (fallback, tokio::spawn(run_item(ctx, item)))
                })
                .collect();

            for (item, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Batch item {} aborted: {}", item.label, e);
                        ItemResult {
                            path: item.label,
                            paper_id: item.paper_id,
                            task_id: None,
                            success: false,
                            attempts: 0,
                            error: Some(format!("item task aborted: {}", e)),
                            error_kind: None,
                            duration_ms: 0,
                            result: None,
                        }
                    }
                };
                results.push(result);
            }

            processed += chunk.len();
            let event = Event::BatchProgress {
                batch_id: batch_id.clone(),
                total,
                processed,
                progress: if total == 0 { 1.0 } else { processed as f64 / total as f64 },
                current_file: chunk.last().map(|p| p.label.clone()),
                current_batch: index + 1,
                total_batches,
                timestamp: Utc::now(),
            };
            if let Some(callback) = &options.progress_callback {
                callback(&event);
            }
            self.bus.publish(event);
            info!(
                "Batch {}: {}/{} done ({}/{} batches)",
                batch_id,
                processed,
                total,
                index + 1,
                total_batches
            );
        }

        // 5. Aggregate
        let stats = BatchStats::aggregate(&results, workflow, started.elapsed());
        info!(
            "Batch {} finished: {}/{} succeeded in {:.1}s",
            batch_id, stats.successful, stats.total, stats.duration_secs
        );
        BatchReport {
            batch_id,
            workflow,
            total_requested,
            total_files: total,
            invalid,
            results,
            stats,
        }
    }

    /// Resolve the item's paper id and source path. Loose files get a minted
    /// id, unique within the run and the store, and are copied into the store.
    async fn prepare(
        &self,
        item: BatchItem,
        now: DateTime<Utc>,
        taken: &mut HashSet<String>,
    ) -> std::result::Result<Prepared, ItemResult> {
        let label = item.path.display().to_string();
        if let Some(paper_id) = item.paper_id {
            taken.insert(paper_id.clone());
            return Ok(Prepared {
                label,
                paper_id,
                source: item.path,
            });
        }

        let store = self.engine.store();
        let category = infer_category(&item.path, &self.categories);
        let original = item
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let filename = sanitize_filename(&original);

        let mut candidate = filename.clone();
        let mut paper_id = mint_paper_id(&category, &candidate, now);
        let mut n = 2;
        while taken.contains(&paper_id) || store.exists(&paper_id).await {
            candidate = with_suffix(&filename, n);
            paper_id = mint_paper_id(&category, &candidate, now);
            n += 1;
        }
        taken.insert(paper_id.clone());

        match self
            .import(&item.path, &paper_id, &category, &original, &candidate)
            .await
        {
            Ok(source) => Ok(Prepared {
                label,
                paper_id,
                source,
            }),
            Err(e) => {
                error!("Failed to import {}: {}", label, e);
                Err(ItemResult {
                    path: label,
                    paper_id,
                    task_id: None,
                    success: false,
                    attempts: 0,
                    error: Some(e.to_string()),
                    error_kind: None,
                    duration_ms: 0,
                    result: None,
                })
            }
        }
    }

    async fn import(
        &self,
        path: &Path,
        paper_id: &str,
        category: &str,
        original: &str,
        filename: &str,
    ) -> Result<PathBuf> {
        let store = self.engine.store();
        let bytes = tokio::fs::read(path).await?;
        let info = store.put_source(paper_id, &bytes, category, original).await?;
        let mut meta = PaperMetadata::new(paper_id, category, original, filename, info.size);
        meta.content_hash = Some(info.content_hash);
        if let Err(e) = store.put_metadata(&meta).await {
            store.discard_source(paper_id, category).await;
            return Err(e);
        }
        Ok(info.path)
    }
}

/// Exists, is a file, and is recognizably a PDF (extension or header).
async fn validate(path: &Path) -> std::result::Result<(), String> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(_) => return Err("File not found".into()),
    };
    if !meta.is_file() {
        return Err("Not a regular file".into());
    }
    let has_pdf_ext = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if has_pdf_ext {
        return Ok(());
    }
    let mut header = [0u8; 8];
    let read = match tokio::fs::File::open(path).await {
        Ok(mut file) => file.read(&mut header).await,
        Err(e) => Err(e),
    };
    match read {
        Ok(n) if deepread_ingest::looks_like_pdf(&header[..n]) => Ok(()),
        Ok(_) => Err("Not a PDF document".into()),
        Err(e) => Err(format!("Unreadable: {}", e)),
    }
}

async fn run_item(ctx: RunContext, item: Prepared) -> ItemResult {
    let started = Instant::now();
    let registry = ctx.engine.registry().clone();
    let task_id = ctx.track_tasks.then(|| {
        registry
            .create(
                &item.paper_id,
                ctx.workflow.as_str(),
                serde_json::json!({ "source": item.label, "batch": true }),
            )
            .task_id
    });

    let mut attempts = 0;
    let mut last: Option<WorkflowResult> = None;
    let mut last_error: Option<String> = None;

    while attempts < ctx.max_attempts {
        attempts += 1;
        let outcome = match ctx.semaphore.acquire().await {
            Ok(_permit) => {
                ctx.engine
                    .run(WorkflowRequest {
                        paper_id: item.paper_id.clone(),
                        source_path: item.source.clone(),
                        workflow: ctx.workflow,
                        options: ctx.options.clone(),
                        task_id: task_id.clone(),
                    })
                    .await
            }
            Err(e) => {
                last_error = Some(format!("semaphore closed: {}", e));
                break;
            }
        };

        if outcome.success {
            last = Some(outcome);
            last_error = None;
            break;
        }
        last_error = outcome.error.clone();
        last = Some(outcome);

        if let Some(id) = &task_id {
            if registry.get(id).map(|t| t.status) == Some(TaskStatus::Cancelled) {
                info!("Task {} cancelled, not retrying {}", id, item.label);
                break;
            }
        }
        if attempts < ctx.max_attempts {
            let delay = ctx.backoff_base * 2u32.saturating_pow(attempts);
            warn!(
                "{} attempt {}/{} failed: {}; retrying in {:?}",
                item.label,
                attempts,
                ctx.max_attempts,
                last_error.as_deref().unwrap_or("unknown error"),
                delay
            );
            if let Some(id) = &task_id {
                registry.log(
                    id,
                    &format!(
                        "attempt {} failed: {}; retrying in {}s",
                        attempts,
                        last_error.as_deref().unwrap_or("unknown error"),
                        delay.as_secs_f64()
                    ),
                );
            }
            tokio::time::sleep(delay).await;
        }
    }

    let success = last.as_ref().is_some_and(|r| r.success);
    if let Some(id) = &task_id {
        let update = if success {
            TaskUpdate::status(TaskStatus::Completed)
                .message("Completed")
                .result(serde_json::to_value(&last).unwrap_or_default())
        } else {
            TaskUpdate::status(TaskStatus::Failed)
                .message(format!("Failed after {} attempt(s)", attempts))
                .error(last_error.clone().unwrap_or_else(|| "unknown error".into()))
        };
        registry.update(id, update);
    }

    ItemResult {
        path: item.label,
        paper_id: item.paper_id,
        task_id,
        success,
        attempts,
        error: if success { None } else { last_error },
        error_kind: last.as_ref().and_then(|r| r.error_kind),
        duration_ms: started.elapsed().as_millis() as u64,
        result: last,
    }
}
