//! API route handlers for the gateway.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use unveil_core::error::UnveilError;
use unveil_core::types::{AudienceSpec, BatchSummary, JobStatus, NewJob, ScheduledJob};
use unveil_scheduler::ImmediateSend;

use super::server::AppState;

/// Engine error rendered as `{error, details}` with a matching status.
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    details: String,
}

impl ApiError {
    fn bad_request(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "Bad request",
            details: details.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<UnveilError> for ApiError {
    fn from(e: UnveilError) -> Self {
        let (status, error) = match &e {
            UnveilError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
            UnveilError::InvalidState(_) => (StatusCode::CONFLICT, "Conflict"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        };
        Self {
            status,
            error,
            details: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "error": self.error,
                "details": self.details,
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "unveil-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

// ---- Dispatch ----

/// Timer invocation: one batch.
pub async fn dispatch_run(State(state): State<Arc<AppState>>) -> ApiResult<BatchSummary> {
    match state.engine.run_batch(Utc::now()).await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            tracing::error!("❌ Dispatch batch failed: {e}");
            Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: "Dispatch batch failed",
                details: e.to_string(),
            })
        }
    }
}

/// Reconciliation sweep only.
pub async fn dispatch_sweep(State(state): State<Arc<AppState>>) -> ApiResult<BatchSummary> {
    Ok(Json(state.engine.sweep_stale(Utc::now()).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub event_id: String,
    pub content: String,
    #[serde(default = "audience_all")]
    pub audience: AudienceSpec,
}

fn audience_all() -> AudienceSpec {
    AudienceSpec::All
}

/// Ad-hoc immediate send.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult<ImmediateSend> {
    let Json(body) = body?;
    if body.content.trim().is_empty() {
        return Err(ApiError::bad_request("'content' is required"));
    }
    let sent = state
        .engine
        .send_immediate(&body.event_id, &body.content, &body.audience)
        .await?;
    Ok(Json(sent))
}

/// Per-recipient audit of one message.
pub async fn message_deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let db = state.engine.db();
    let message = db.get_message(&id)?;
    let deliveries = db.list_deliveries(&id)?;
    let summary = db.delivery_summary(&id)?;
    Ok(Json(serde_json::json!({
        "message": message,
        "summary": summary,
        "deliveries": deliveries,
    })))
}

// ---- Jobs ----

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewJob>, JsonRejection>,
) -> Result<(StatusCode, Json<ScheduledJob>), ApiError> {
    let Json(body) = body?;
    if body.template_content.trim().is_empty() {
        return Err(ApiError::bad_request("'templateContent' is required"));
    }
    if body.event_id.is_empty() {
        return Err(ApiError::bad_request("'eventId' is required"));
    }
    let job = state.engine.db().create_job(&body, Utc::now())?;
    tracing::info!("🗓️ Job {} scheduled for {}", job.id, job.send_at);
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<ScheduledJob>> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<JobStatus>()
                .map_err(|_| ApiError::bad_request(format!("unknown status '{s}'")))?,
        ),
        None => None,
    };
    Ok(Json(state.engine.db().list_jobs(status)?))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ScheduledJob> {
    Ok(Json(state.engine.db().get_job(&id)?))
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ScheduledJob> {
    Ok(Json(state.engine.cancel_job(&id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleRequest {
    pub send_at: DateTime<Utc>,
}

pub async fn reschedule_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<RescheduleRequest>, JsonRejection>,
) -> ApiResult<ScheduledJob> {
    let Json(body) = body?;
    let job = state.engine.db().reschedule_job(&id, body.send_at)?;
    tracing::info!("🗓️ Job {id} moved to {}", job.send_at);
    Ok(Json(job))
}
