//! Task routes: listing, detail, cancel, logs and cleanup.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use deepread_runtime::{CancelOutcome, CleanupOutcome, Task, TaskFilter, TaskStats, TaskStatus};
use serde::Deserialize;
use tracing::info;

use super::{page_limit, ApiError, ApiResult};
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/", get(list_tasks))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/cleanup", delete(cleanup_tasks))
        .route("/tasks/{task_id}", get(get_task).delete(cancel_task))
        .route("/tasks/{task_id}/logs", get(task_logs))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    paper_id: Option<String>,
    workflow: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /api/tasks: newest first, filtered by status, paper and workflow.
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = page_limit(query.limit, 50, 100)?;
    let offset = query.offset.unwrap_or(0);
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    let filter = TaskFilter {
        status,
        paper_id: query.paper_id,
        workflow: query.workflow,
    };

    let (tasks, total) = state.orchestrator.list_tasks(&filter, offset, limit);
    Ok(Json(serde_json::json!({
        "tasks": tasks,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /api/tasks/stats
async fn task_stats(State(state): State<Arc<AppState>>) -> Json<TaskStats> {
    Json(state.orchestrator.task_stats())
}

/// GET /api/tasks/{id}
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.get_task(&task_id)?))
}

/// DELETE /api/tasks/{id}: cancel; terminal tasks are returned unchanged.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<CancelOutcome>> {
    Ok(Json(state.orchestrator.cancel_task(&task_id)?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

/// GET /api/tasks/{id}/logs?lines=N
async fn task_logs(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let lines = query.lines.unwrap_or(100);
    if !(1..=1000).contains(&lines) {
        return Err(ApiError::validation("lines must be between 1 and 1000"));
    }
    let logs = state.orchestrator.task_logs(&task_id, lines)?;
    Ok(Json(serde_json::json!({
        "task_id": task_id,
        "logs": logs,
        "total_lines": logs.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    older_than_hours: Option<i64>,
}

/// DELETE /api/tasks/cleanup?older_than_hours=H: drops old terminal tasks.
async fn cleanup_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<Json<CleanupOutcome>> {
    let hours = query.older_than_hours.unwrap_or(24);
    let outcome = state.orchestrator.cleanup_tasks(hours)?;
    info!("Task cleanup removed {} tasks", outcome.cleaned);
    Ok(Json(outcome))
}
