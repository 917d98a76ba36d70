//! Audit trigger and batch history endpoints
//!
//! POST /audit/run, /audit/enqueue, /audit/requeue, /audit/drain
//! GET /audit/batches, /audit/batches/:id

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::batches;
use crate::error::{ApiError, ApiResult};
use crate::models::{AuditBatch, AuditResult, BatchCounts, BatchHandle, BatchStatus, Usage};
use crate::services::audit_runner::RunSummary;
use crate::AppState;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

/// POST /audit/run and /audit/enqueue request
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub organization_id: i64,
    #[serde(default)]
    pub transaction_ids: Option<Vec<i64>>,
}

/// POST /audit/requeue request
#[derive(Debug, Deserialize)]
pub struct RequeueRequest {
    pub organization_id: i64,
    pub transaction_ids: Vec<i64>,
}

/// POST /audit/drain request
#[derive(Debug, Default, Deserialize)]
pub struct DrainRequest {
    #[serde(default)]
    pub organization_id: Option<i64>,
}

/// GET /audit/batches query
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub organization_id: Option<i64>,
    pub limit: Option<u32>,
}

/// POST /audit/run response
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub success: bool,
    pub batch_id: Option<i64>,
    pub status: Option<BatchStatus>,
    pub queued_count: usize,
    pub counts: BatchCounts,
    pub usage: Usage,
    pub results: Vec<AuditResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub batches: Vec<AuditBatch>,
}

/// POST /audit/run
///
/// Enqueue and drain synchronously, returning per-transaction outcomes.
pub async fn run_audit(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<Json<RunResponse>> {
    if state.runner.is_running() {
        return Err(ApiError::Conflict("An audit pass is already running".to_string()));
    }

    let run = state
        .runner
        .run_on_demand(request.organization_id, request.transaction_ids.as_deref())
        .await?;

    let (results, report_error) = match run.report {
        Some(report) => (report.results, report.error),
        None => (Vec::new(), None),
    };
    let error = report_error.or_else(|| run.batch.as_ref().and_then(|b| b.error_message.clone()));
    if let Some(message) = &error {
        *state.last_error.write().await = Some(message.clone());
    }

    let (status, counts, usage) = match &run.batch {
        Some(batch) => (Some(batch.status), batch.counts, batch.usage),
        None => (None, BatchCounts::default(), Usage::default()),
    };

    Ok(Json(RunResponse {
        success: error.is_none() && status != Some(BatchStatus::Failed),
        batch_id: run.handle.batch_id,
        status,
        queued_count: run.handle.queued_count,
        counts,
        usage,
        results,
        error,
    }))
}

/// POST /audit/enqueue
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<Json<BatchHandle>> {
    let handle = state
        .runner
        .enqueuer()
        .enqueue(request.organization_id, request.transaction_ids.as_deref())
        .await?;
    Ok(Json(handle))
}

/// POST /audit/requeue
pub async fn requeue(
    State(state): State<AppState>,
    Json(request): Json<RequeueRequest>,
) -> ApiResult<Json<BatchHandle>> {
    if request.transaction_ids.is_empty() {
        return Err(ApiError::BadRequest(
            "transaction_ids must not be empty".to_string(),
        ));
    }
    let handle = state
        .runner
        .enqueuer()
        .requeue(request.organization_id, &request.transaction_ids)
        .await?;
    Ok(Json(handle))
}

/// POST /audit/drain
pub async fn drain(
    State(state): State<AppState>,
    request: Option<Json<DrainRequest>>,
) -> ApiResult<Json<RunSummary>> {
    if state.runner.is_running() {
        return Err(ApiError::Conflict("An audit pass is already running".to_string()));
    }
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let summary = state.runner.drain(request.organization_id).await;
    if let Some(error) = summary.errors.last() {
        *state.last_error.write().await = Some(error.clone());
    }
    Ok(Json(summary))
}

/// GET /audit/batches
pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_HISTORY_LIMIT
        )));
    }
    let batches = batches::list_batches(&state.db, query.organization_id, limit).await?;
    Ok(Json(HistoryResponse { batches }))
}

/// GET /audit/batches/:id
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> ApiResult<Json<AuditBatch>> {
    batches::get_batch(&state.db, batch_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Audit batch {}", batch_id)))
}

/// Build audit routes
pub fn audit_routes() -> Router<AppState> {
    Router::new()
        .route("/audit/run", post(run_audit))
        .route("/audit/enqueue", post(enqueue))
        .route("/audit/requeue", post(requeue))
        .route("/audit/drain", post(drain))
        .route("/audit/batches", get(list_batches))
        .route("/audit/batches/:id", get(get_batch))
}
