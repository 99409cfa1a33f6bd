//! Paper routes: upload, process, content, listing, batch and reports.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use deepread_core::ContentKind;
use deepread_runtime::{
    BatchOptions, BatchReport, ContentView, ProcessOutcome, ReportView, UploadRecord, Workflow,
    WorkflowOptions,
};
use deepread_store::{PaperFilter, PaperMetadata, PaperStatus};
use serde::Deserialize;
use tracing::{debug, info};

use super::{page_limit, ApiError, ApiResult};
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/papers", get(list_papers))
        .route("/papers/", get(list_papers))
        .route("/papers/upload", post(upload_paper))
        .route("/papers/batch", post(batch_process))
        .route("/papers/{paper_id}", delete(delete_paper))
        .route("/papers/{paper_id}/process", post(process_paper))
        .route("/papers/{paper_id}/status", get(paper_status))
        .route("/papers/{paper_id}/content", get(paper_content))
        .route("/papers/{paper_id}/source", get(paper_source))
        .route("/papers/{paper_id}/report", get(paper_report))
        .route("/papers/{paper_id}/translate", post(translate_paper))
        .route("/papers/{paper_id}/analyze", post(analyze_paper))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    category: Option<String>,
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::validation("File too large")
    } else {
        ApiError::validation(format!("Invalid multipart body: {}", e.body_text()))
    }
}

/// POST /api/papers/upload: multipart upload of one PDF.
async fn upload_paper(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadRecord>> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(multipart_error)?;
        debug!("Received upload {} ({} bytes)", filename, bytes.len());

        let record = state
            .orchestrator
            .upload(&bytes, &filename, query.category.as_deref())
            .await?;
        return Ok(Json(record));
    }
    Err(ApiError::validation("No file provided"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProcessBody {
    workflow: Option<String>,
    options: Option<WorkflowOptions>,
    /// Return the pending task at once instead of waiting for the workflow.
    background: bool,
}

/// POST /api/papers/{id}/process: body `{workflow, options, background}`, all optional.
async fn process_paper(
    State(state): State<Arc<AppState>>,
    Path(paper_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ProcessOutcome>> {
    let body: ProcessBody = if body.iter().all(u8::is_ascii_whitespace) {
        ProcessBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::validation(format!("Invalid request body: {}", e)))?
    };
    let workflow: Workflow = body.workflow.as_deref().unwrap_or("full").parse()?;
    let options = body.options.unwrap_or_default();

    let orchestrator = &state.orchestrator;
    let outcome = if body.background {
        orchestrator.submit(&paper_id, workflow, options).await?
    } else {
        orchestrator.process(&paper_id, workflow, options).await?
    };
    Ok(Json(outcome))
}

/// GET /api/papers/{id}/status
async fn paper_status(
    State(state): State<Arc<AppState>>,
    Path(paper_id): Path<String>,
) -> ApiResult<Json<PaperMetadata>> {
    Ok(Json(state.orchestrator.get_status(&paper_id).await?))
}

#[derive(Debug, Deserialize)]
struct ContentQuery {
    content_type: Option<String>,
}

/// GET /api/papers/{id}/content?content_type=source|translation|heartfelt
async fn paper_content(
    State(state): State<Arc<AppState>>,
    Path(paper_id): Path<String>,
    Query(query): Query<ContentQuery>,
) -> ApiResult<Json<ContentView>> {
    let kind: ContentKind = query.content_type.as_deref().unwrap_or("source").parse()?;
    Ok(Json(state.orchestrator.get_content(&paper_id, kind).await?))
}

/// GET /api/papers/{id}/source: the stored PDF bytes.
async fn paper_source(
    State(state): State<Arc<AppState>>,
    Path(paper_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (meta, bytes) = state.orchestrator.source_bytes(&paper_id).await?;
    let disposition = format!("inline; filename=\"{}\"", meta.filename);
    Ok((
        [
            (CONTENT_TYPE, "application/pdf".to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    category: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /api/papers: paginated listing with optional category/status filters.
async fn list_papers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = page_limit(query.limit, 20, 100)?;
    let offset = query.offset.unwrap_or(0);
    let status = query
        .status
        .as_deref()
        .map(str::parse::<PaperStatus>)
        .transpose()?;
    let filter = PaperFilter {
        category: query.category,
        status,
    };

    let (papers, total) = state.orchestrator.list(&filter, offset, limit).await?;
    Ok(Json(serde_json::json!({
        "papers": papers,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// DELETE /api/papers/{id}: removes every artifact and the metadata record.
async fn delete_paper(
    State(state): State<Arc<AppState>>,
    Path(paper_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.orchestrator.delete(&paper_id).await?;
    info!("Deleted paper {}", paper_id);
    Ok(Json(serde_json::json!({
        "deleted": outcome.deleted,
        "paper_id": paper_id,
    })))
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    workflow: Option<String>,
}

/// POST /api/papers/batch?workflow=X: body is a JSON array of paper ids.
async fn batch_process(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BatchQuery>,
    Json(paper_ids): Json<Vec<String>>,
) -> ApiResult<Json<BatchReport>> {
    let workflow: Workflow = query.workflow.as_deref().unwrap_or("full").parse()?;
    let report = state
        .orchestrator
        .batch(paper_ids, workflow, BatchOptions::default())
        .await?;
    Ok(Json(report))
}

/// GET /api/papers/{id}/report
async fn paper_report(
    State(state): State<Arc<AppState>>,
    Path(paper_id): Path<String>,
) -> ApiResult<Json<ReportView>> {
    Ok(Json(state.orchestrator.get_report(&paper_id).await?))
}

/// POST /api/papers/{id}/translate
async fn translate_paper(
    State(state): State<Arc<AppState>>,
    Path(paper_id): Path<String>,
) -> ApiResult<Json<ProcessOutcome>> {
    Ok(Json(state.orchestrator.translate(&paper_id).await?))
}

/// POST /api/papers/{id}/analyze
async fn analyze_paper(
    State(state): State<Arc<AppState>>,
    Path(paper_id): Path<String>,
) -> ApiResult<Json<ProcessOutcome>> {
    Ok(Json(state.orchestrator.analyze(&paper_id).await?))
}
