//! In-memory task registry.
//!
//! Every mutation goes through one lock, and the event for a mutation is
//! published while that lock is held, so events for one task are totally
//! ordered. Status moves only along
//! `pending -> processing -> {completed | failed | cancelled}` (plus
//! `pending -> cancelled`); terminal states absorb all later updates.
//!
//! Each task also has an append-only log of timestamped lines, kept in memory
//! and mirrored to `<log_dir>/<task_id>.log` when a log directory is set.
//! State does not survive a restart.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use deepread_core::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` follows the status DAG. Staying in place is allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!("Invalid task status: {}", other))),
        }
    }
}

/// A tracked workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub paper_id: String,
    pub workflow: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Fields to change in one update. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<i64>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(mut self, progress: i64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub paper_id: Option<String>,
    pub workflow: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.paper_id.as_deref().map_or(true, |p| task.paper_id == p)
            && self.workflow.as_deref().map_or(true, |w| task.workflow == w)
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    /// False when the task was already terminal.
    pub cancelled: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy)]
enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

struct TaskEntry {
    task: Task,
    logs: Vec<String>,
    /// Insertion order, tie-breaker for equal `created_at`.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TaskEntry>,
    next_seq: u64,
}

pub struct TaskRegistry {
    inner: Mutex<Inner>,
    bus: Arc<EventBus>,
    log_dir: Option<PathBuf>,
}

impl TaskRegistry {
    pub fn new(bus: Arc<EventBus>, log_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &log_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Cannot create task log directory {}: {}", dir.display(), e);
            }
        }
        Self {
            inner: Mutex::new(Inner::default()),
            bus,
            log_dir,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn log_path(&self, task_id: &str) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", task_id)))
    }

    fn append_log(&self, entry: &mut TaskEntry, level: LogLevel, text: &str) {
        let line = format!("[{}] {} {}", Utc::now().to_rfc3339(), level.as_str(), text);
        if let Some(path) = self.log_path(&entry.task.task_id) {
            let written = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| writeln!(f, "{}", line));
            if let Err(e) = written {
                warn!("Failed to write task log {}: {}", path.display(), e);
            }
        }
        entry.logs.push(line);
    }

    fn publish_update(&self, task: &Task) {
        self.bus.publish(Event::TaskUpdate {
            task_id: task.task_id.clone(),
            status: task.status,
            progress: task.progress,
            message: task.message.clone(),
            timestamp: task.updated_at,
        });
    }

    fn publish_completed(&self, task: &Task) {
        self.bus.publish(Event::TaskCompleted {
            task_id: task.task_id.clone(),
            success: task.status == TaskStatus::Completed,
            result: task.result.clone(),
            error: task.error.clone(),
            timestamp: task.updated_at,
        });
    }

    /// Register a new pending task and open its log.
    pub fn create(&self, paper_id: &str, workflow: &str, params: serde_json::Value) -> Task {
        let now = Utc::now();
        let task = Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            paper_id: paper_id.to_string(),
            workflow: workflow.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            message: "Task created".to_string(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            params,
        };

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let mut entry = TaskEntry {
            task: task.clone(),
            logs: Vec::new(),
            seq,
        };
        self.append_log(
            &mut entry,
            LogLevel::Info,
            &format!("Task created: paper={} workflow={}", paper_id, workflow),
        );
        inner.tasks.insert(task.task_id.clone(), entry);
        self.publish_update(&task);

        info!("Created task {} ({} on {})", task.task_id, workflow, paper_id);
        task
    }

    /// Apply an update. Returns the new record, or `None` if the update was
    /// dropped (unknown task, terminal task, or a backwards transition).
    pub fn update(&self, task_id: &str, update: TaskUpdate) -> Option<Task> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.tasks.get_mut(task_id) else {
            warn!("Update for unknown task {} dropped", task_id);
            return None;
        };

        let current = entry.task.status;
        if current.is_terminal() {
            debug!("Update for terminal task {} ({}) ignored", task_id, current);
            return None;
        }
        let next = update.status.unwrap_or(current);
        if !current.can_transition_to(next) {
            warn!("Invalid transition {} -> {} for task {}", current, next, task_id);
            return None;
        }

        let task = &mut entry.task;
        task.status = next;
        if let Some(message) = update.message {
            task.message = message;
        }
        if next == TaskStatus::Completed {
            task.progress = 100;
            task.result = update.result;
        } else if let Some(progress) = update.progress {
            // 100 is reserved for completion.
            task.progress = progress.clamp(0, 99) as u8;
        }
        if matches!(next, TaskStatus::Failed | TaskStatus::Cancelled) {
            task.error = Some(
                update
                    .error
                    .unwrap_or_else(|| format!("Task {}", next.as_str())),
            );
        }
        task.updated_at = Utc::now();

        let snapshot = task.clone();
        let (level, text) = match next {
            TaskStatus::Failed => (
                LogLevel::Error,
                format!("status=failed error={}", snapshot.error.as_deref().unwrap_or("")),
            ),
            TaskStatus::Cancelled => (LogLevel::Warn, format!("status=cancelled {}", snapshot.message)),
            _ => (
                LogLevel::Info,
                format!(
                    "status={} progress={} {}",
                    next, snapshot.progress, snapshot.message
                ),
            ),
        };
        self.append_log(entry, level, &text);

        self.publish_update(&snapshot);
        if next.is_terminal() {
            self.publish_completed(&snapshot);
        }
        Some(snapshot)
    }

    /// Append a line to the task's log without touching its state. Works on
    /// terminal tasks too.
    pub fn log(&self, task_id: &str, text: &str) {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(task_id) {
            Some(entry) => self.append_log(entry, LogLevel::Info, text),
            None => warn!("Log for unknown task {} dropped", task_id),
        }
    }

    /// Idempotent cancel. Already-terminal tasks are returned unchanged.
    pub fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        let current = self
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        if current.status.is_terminal() {
            return Ok(CancelOutcome {
                task_id: task_id.to_string(),
                status: current.status,
                cancelled: false,
                message: format!("Task already {}", current.status),
            });
        }

        let update = TaskUpdate::status(TaskStatus::Cancelled)
            .message("Task cancelled by user")
            .error("Cancelled by user");
        match self.update(task_id, update) {
            Some(task) => {
                info!("Cancelled task {}", task_id);
                Ok(CancelOutcome {
                    task_id: task_id.to_string(),
                    status: task.status,
                    cancelled: true,
                    message: task.message,
                })
            }
            // Reached a terminal state between the read and the update.
            None => {
                let task = self
                    .get(task_id)
                    .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
                Ok(CancelOutcome {
                    task_id: task_id.to_string(),
                    status: task.status,
                    cancelled: false,
                    message: format!("Task already {}", task.status),
                })
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.lock().tasks.get(task_id).map(|e| e.task.clone())
    }

    pub fn require(&self, task_id: &str) -> Result<Task> {
        self.get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Filtered page, newest first, plus the filtered total.
    pub fn list(&self, filter: &TaskFilter, offset: usize, limit: usize) -> (Vec<Task>, usize) {
        let inner = self.inner.lock();
        let mut entries: Vec<&TaskEntry> = inner
            .tasks
            .values()
            .filter(|e| filter.matches(&e.task))
            .collect();
        entries.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        let total = entries.len();
        let page = entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|e| e.task.clone())
            .collect();
        (page, total)
    }

    /// Last `tail` log lines of a task.
    pub fn get_logs(&self, task_id: &str, tail: usize) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let entry = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let start = entry.logs.len().saturating_sub(tail);
        Ok(entry.logs[start..].to_vec())
    }

    /// Remove terminal tasks last updated before `cutoff`, with their logs.
    pub fn gc(&self, cutoff: DateTime<Utc>) -> usize {
        let removed: Vec<String> = {
            let mut inner = self.inner.lock();
            let stale: Vec<String> = inner
                .tasks
                .values()
                .filter(|e| e.task.status.is_terminal() && e.task.updated_at < cutoff)
                .map(|e| e.task.task_id.clone())
                .collect();
            for id in &stale {
                inner.tasks.remove(id);
            }
            stale
        };

        for id in &removed {
            if let Some(path) = self.log_path(id) {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove task log {}: {}", path.display(), e);
                    }
                }
            }
        }
        if !removed.is_empty() {
            info!("Cleaned up {} finished tasks", removed.len());
        }
        removed.len()
    }

    pub fn stats(&self) -> TaskStats {
        let inner = self.inner.lock();
        let mut stats = TaskStats {
            total: inner.tasks.len(),
            ..Default::default()
        };
        for entry in inner.tasks.values() {
            match entry.task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> (TaskRegistry, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (TaskRegistry::new(bus.clone(), None), bus)
    }

    #[test]
    fn test_create_is_pending() {
        let (reg, bus) = registry();
        let mut rx = bus.subscribe();
        let task = reg.create("p1", "extract_only", json!({}));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.created_at, task.updated_at);
        assert!(matches!(rx.try_recv().unwrap(), Event::TaskUpdate { .. }));
        assert_eq!(reg.get_logs(&task.task_id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_progress_clamped_and_reserved() {
        let (reg, _bus) = registry();
        let id = reg.create("p1", "full", json!({})).task_id;

        let t = reg
            .update(&id, TaskUpdate::status(TaskStatus::Processing).progress(250))
            .unwrap();
        assert_eq!(t.progress, 99);
        let t = reg.update(&id, TaskUpdate::default().progress(-5)).unwrap();
        assert_eq!(t.progress, 0);

        let t = reg
            .update(&id, TaskUpdate::status(TaskStatus::Completed).result(json!({"ok": true})))
            .unwrap();
        assert_eq!(t.progress, 100);
        assert_eq!(t.result, Some(json!({"ok": true})));
        assert!(t.error.is_none());
    }

    #[test]
    fn test_result_only_on_completed_error_only_on_failure() {
        let (reg, _bus) = registry();
        let id = reg.create("p1", "full", json!({})).task_id;
        let t = reg
            .update(
                &id,
                TaskUpdate::status(TaskStatus::Processing)
                    .result(json!(1))
                    .error("early"),
            )
            .unwrap();
        assert!(t.result.is_none());
        assert!(t.error.is_none());

        let t = reg
            .update(&id, TaskUpdate::status(TaskStatus::Failed).error("boom"))
            .unwrap();
        assert_eq!(t.error.as_deref(), Some("boom"));
        assert!(t.result.is_none());
        assert_eq!(t.progress, 0);
    }

    #[test]
    fn test_terminal_states_absorb() {
        let (reg, bus) = registry();
        let id = reg.create("p1", "full", json!({})).task_id;
        reg.update(&id, TaskUpdate::status(TaskStatus::Processing));
        reg.update(&id, TaskUpdate::status(TaskStatus::Completed));

        let mut rx = bus.subscribe();
        assert!(reg.update(&id, TaskUpdate::status(TaskStatus::Failed)).is_none());
        assert!(reg.update(&id, TaskUpdate::default().progress(10)).is_none());
        assert_eq!(reg.get(&id).unwrap().status, TaskStatus::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_no_backwards_or_skipping_transitions() {
        let (reg, _bus) = registry();
        let id = reg.create("p1", "full", json!({})).task_id;
        // pending -> completed skips processing
        assert!(reg.update(&id, TaskUpdate::status(TaskStatus::Completed)).is_none());
        reg.update(&id, TaskUpdate::status(TaskStatus::Processing));
        assert!(reg.update(&id, TaskUpdate::status(TaskStatus::Pending)).is_none());
        assert_eq!(reg.get(&id).unwrap().status, TaskStatus::Processing);
    }

    #[test]
    fn test_update_unknown_is_noop() {
        let (reg, bus) = registry();
        let mut rx = bus.subscribe();
        assert!(reg.update("missing", TaskUpdate::status(TaskStatus::Processing)).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_idempotent() {
        let (reg, bus) = registry();
        let id = reg.create("p1", "full", json!({})).task_id;
        reg.update(&id, TaskUpdate::status(TaskStatus::Processing).progress(40));

        let mut rx = bus.subscribe();
        let first = reg.cancel(&id).unwrap();
        assert!(first.cancelled);
        assert_eq!(first.status, TaskStatus::Cancelled);
        match rx.try_recv().unwrap() {
            Event::TaskUpdate { status, .. } => assert_eq!(status, TaskStatus::Cancelled),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::TaskCompleted { success: false, .. }
        ));

        let second = reg.cancel(&id).unwrap();
        assert!(!second.cancelled);
        assert_eq!(second.status, TaskStatus::Cancelled);
        assert!(rx.try_recv().is_err());

        // A late upstream success is dropped.
        assert!(reg.update(&id, TaskUpdate::status(TaskStatus::Completed)).is_none());
        let task = reg.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.progress, 40);
        assert!(task.error.is_some());

        assert!(matches!(reg.cancel("nope"), Err(Error::TaskNotFound(_))));
    }

    #[test]
    fn test_cancel_from_pending() {
        let (reg, _bus) = registry();
        let id = reg.create("p1", "full", json!({})).task_id;
        assert!(reg.cancel(&id).unwrap().cancelled);
    }

    #[test]
    fn test_list_filters_and_order() {
        let (reg, _bus) = registry();
        let a = reg.create("p1", "full", json!({})).task_id;
        let b = reg.create("p2", "extract_only", json!({})).task_id;
        let c = reg.create("p1", "extract_only", json!({})).task_id;
        reg.update(&c, TaskUpdate::status(TaskStatus::Processing));

        let (all, total) = reg.list(&TaskFilter::default(), 0, 100);
        assert_eq!(total, 3);
        assert_eq!(
            all.iter().map(|t| t.task_id.clone()).collect::<Vec<_>>(),
            vec![c.clone(), b.clone(), a.clone()]
        );

        let by_paper = TaskFilter {
            paper_id: Some("p1".into()),
            ..Default::default()
        };
        let (_, paper_total) = reg.list(&by_paper, 0, 100);
        assert_eq!(paper_total, 2);

        let narrower = TaskFilter {
            paper_id: Some("p1".into()),
            workflow: Some("extract_only".into()),
            status: Some(TaskStatus::Processing),
        };
        let (tasks, narrow_total) = reg.list(&narrower, 0, 100);
        assert!(narrow_total <= paper_total);
        assert_eq!(tasks[0].task_id, c);

        let (page, total) = reg.list(&TaskFilter::default(), 1, 1);
        assert_eq!(total, 3);
        assert_eq!(page[0].task_id, b);
    }

    #[test]
    fn test_logs_tail_and_file_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let reg = TaskRegistry::new(bus, Some(dir.path().to_path_buf()));
        let id = reg.create("p1", "full", json!({})).task_id;
        reg.update(&id, TaskUpdate::status(TaskStatus::Processing).message("Extracting"));
        reg.update(&id, TaskUpdate::status(TaskStatus::Failed).error("boom"));

        let logs = reg.get_logs(&id, 1000).unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs[2].contains("ERROR status=failed error=boom"));
        assert!(logs[0].starts_with('['));

        let tail = reg.get_logs(&id, 1).unwrap();
        assert_eq!(tail, vec![logs[2].clone()]);

        let file = std::fs::read_to_string(dir.path().join(format!("{}.log", id))).unwrap();
        assert_eq!(file.lines().count(), 3);

        assert!(matches!(reg.get_logs("nope", 5), Err(Error::TaskNotFound(_))));
    }

    #[test]
    fn test_gc_removes_only_old_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let reg = TaskRegistry::new(bus, Some(dir.path().to_path_buf()));
        let done = reg.create("p1", "full", json!({})).task_id;
        reg.update(&done, TaskUpdate::status(TaskStatus::Processing));
        reg.update(&done, TaskUpdate::status(TaskStatus::Completed));
        let running = reg.create("p2", "full", json!({})).task_id;
        reg.update(&running, TaskUpdate::status(TaskStatus::Processing));

        // Nothing is older than an hour.
        assert_eq!(reg.gc(Utc::now() - chrono::Duration::hours(1)), 0);
        // Everything terminal is older than "-1 second".
        assert_eq!(reg.gc(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(reg.get(&done).is_none());
        assert!(reg.get(&running).is_some());
        assert!(!dir.path().join(format!("{}.log", done)).exists());
    }

    #[test]
    fn test_stats() {
        let (reg, _bus) = registry();
        let a = reg.create("p1", "full", json!({})).task_id;
        reg.create("p2", "full", json!({}));
        reg.cancel(&a).unwrap();
        let stats = reg.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.cancelled, 1);
    }
}
