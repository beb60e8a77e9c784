// src/api.rs
use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::batch::{BatchJob, BatchOrchestrator, IngestReport};
use crate::error::{BatchError, StoreError};
use crate::idea::{parse_vocab, Idea};
use crate::message::{Message, MessageId, ParseStatus};
use crate::pipeline::{MessageReport, Pipeline};
use crate::store::{IdeaQuery, IdeaStore};

const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub batch: Arc<BatchOrchestrator>,
    /// Submitted jobs not yet ingested, by job id.
    pub batch_jobs: Arc<Mutex<HashMap<String, BatchJob>>>,
}

impl AppState {
    fn store(&self) -> &Arc<dyn IdeaStore> {
        self.pipeline.store()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ideas", get(list_ideas))
        .route("/messages", get(list_messages).post(intake_message))
        .route("/messages/{id}", get(get_message))
        .route("/messages/{id}/ideas", get(message_ideas))
        .route("/messages/{id}/reprocess", post(reprocess_message))
        .route("/admin/reset-stale", post(reset_stale))
        .route("/admin/batch", get(list_batches).post(submit_batch))
        .route("/admin/batch/{job}/ingest", post(ingest_batch))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Upstream(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownMessage(id) => ApiError::NotFound(format!("unknown message {id}")),
            other => ApiError::Store(other),
        }
    }
}

impl From<BatchError> for ApiError {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::UnknownJob(id) => ApiError::NotFound(format!("unknown batch job {id}")),
            BatchError::NotReady(_) => ApiError::Conflict(e.to_string()),
            BatchError::Facility(_) => ApiError::Upstream(e.to_string()),
            BatchError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Upstream(m) => {
                warn!(error = %m, "batch facility failure behind API");
                (StatusCode::BAD_GATEWAY, m)
            }
            ApiError::Store(e) => {
                warn!(error = %e, "store failure behind API");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

fn vocab<T: serde::de::DeserializeOwned>(
    field: &str,
    raw: Option<&str>,
) -> Result<Option<T>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_vocab::<T>(s)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown {field}: {s}"))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct IdeasParams {
    symbol: Option<String>,
    direction: Option<String>,
    action: Option<String>,
    horizon: Option<String>,
    label: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn list_ideas(
    State(state): State<AppState>,
    Query(p): Query<IdeasParams>,
) -> Result<Json<Vec<Idea>>, ApiError> {
    let query = IdeaQuery {
        symbol: p.symbol.filter(|s| !s.trim().is_empty()),
        direction: vocab("direction", p.direction.as_deref())?,
        action: vocab("action", p.action.as_deref())?,
        horizon: vocab("horizon", p.horizon.as_deref())?,
        label: vocab("label", p.label.as_deref())?,
        since: p.since,
        until: p.until,
        limit: Some(p.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
    };
    Ok(Json(state.store().query_ideas(&query).await?))
}

#[derive(Debug, Default, Deserialize)]
struct MessagesParams {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(p): Query<MessagesParams>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let status = match p.status.as_deref() {
        None => ParseStatus::Pending,
        Some(s) => ParseStatus::parse(s)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {s}")))?,
    };
    let limit = p.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.store().messages_by_status(status, limit).await?))
}

async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Message>, ApiError> {
    let id = MessageId::new(id);
    state
        .store()
        .message(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown message {id}")))
}

async fn message_ideas(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Idea>>, ApiError> {
    let id = MessageId::new(id);
    if state.store().message(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("unknown message {id}")));
    }
    Ok(Json(state.store().ideas_for_message(&id).await?))
}

#[derive(Debug, Deserialize)]
struct IntakeReq {
    id: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    author: String,
    text: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct IntakeResp {
    id: MessageId,
    changed: bool,
}

async fn intake_message(
    State(state): State<AppState>,
    Json(body): Json<IntakeReq>,
) -> Result<(StatusCode, Json<IntakeResp>), ApiError> {
    if body.id.trim().is_empty() {
        return Err(ApiError::BadRequest("id must not be empty".to_string()));
    }
    let message = Message::new(
        MessageId::new(body.id),
        body.channel,
        body.author,
        body.text,
        body.created_at.unwrap_or_else(Utc::now),
    );
    let id = message.id.clone();
    let changed = state.store().upsert_message(message).await?;
    let status = if changed {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(IntakeResp { id, changed })))
}

async fn reprocess_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageReport>, ApiError> {
    let id = MessageId::new(id);
    Ok(Json(state.pipeline.reprocess(&id).await?))
}

async fn reset_stale(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let version = state.pipeline.prompt_version().to_string();
    let reset = state.store().reset_stale(&version).await?;
    Ok(Json(json!({ "reset": reset, "prompt_version": version })))
}

#[derive(Debug, Default, Deserialize)]
struct BatchParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct BatchSummary {
    job_id: String,
    messages: usize,
    requests: usize,
}

impl From<&BatchJob> for BatchSummary {
    fn from(job: &BatchJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            messages: job.manifest.entries.len(),
            requests: job.manifest.request_count(),
        }
    }
}

/// Submit pending messages as one batch; 204 when nothing needs a model call.
async fn submit_batch(
    State(state): State<AppState>,
    Query(p): Query<BatchParams>,
) -> Result<Response, ApiError> {
    let limit = p.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let Some(job) = state.batch.submit(limit).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let summary = BatchSummary::from(&job);
    state.batch_jobs.lock().await.insert(job.job_id.clone(), job);
    Ok((StatusCode::ACCEPTED, Json(summary)).into_response())
}

async fn list_batches(State(state): State<AppState>) -> Json<Vec<BatchSummary>> {
    let jobs = state.batch_jobs.lock().await;
    let mut out: Vec<BatchSummary> = jobs.values().map(BatchSummary::from).collect();
    out.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Json(out)
}

/// Ingest a finished job. The job is forgotten once its results are committed.
async fn ingest_batch(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<IngestReport>, ApiError> {
    let job = state
        .batch_jobs
        .lock()
        .await
        .get(&job_id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("unknown batch job {job_id}")))?;
    let report = state.batch.ingest(&job).await?;
    state.batch_jobs.lock().await.remove(&job_id);
    info!(job_id = %job_id, committed = report.committed.len(), "batch job closed");
    Ok(Json(report))
}
