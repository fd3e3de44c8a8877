//! HTTP API for the generation orchestrator.
//!
//! ## Endpoints
//!
//! - `POST /api/jobs` - Submit a generation job
//! - `GET /api/jobs` - List the caller's jobs
//! - `GET /api/jobs/{id}` - Job status, artifacts, error detail
//! - `POST /api/jobs/{id}/approve` - Approve the named gate (optionally with an edited script)
//! - `POST /api/jobs/{id}/reject` - Reject the named gate
//! - `POST /api/jobs/{id}/cancel` - Cancel a job
//! - `POST /api/jobs/{id}/retry` - Retry a failed job
//! - `POST /api/jobs/{id}/dismiss-error` - Hide a job's error detail
//! - `GET /api/credits` - Credit balance
//! - `POST /api/credits/grant` - Add credits (billing webhook target)
//! - `GET /api/health` - Health check
//!
//! Authentication happens upstream; the trusted `x-user-id` header carries
//! the caller's identity.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::{ErrorDetail, ForgeError};
use crate::job::{ArtifactRefs, JobRecord, Stage};
use crate::orchestrator::{NewJobRequest, Orchestrator};
use crate::schema::ParamMap;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/approve", post(approve_job))
        .route("/api/jobs/:id/reject", post(reject_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/jobs/:id/retry", post(retry_job))
        .route("/api/jobs/:id/dismiss-error", post(dismiss_error))
        .route("/api/credits", get(credits))
        .route("/api/credits/grant", post(grant_credits))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// JSON error body paired with a status derived from the error kind.
struct ApiError(ForgeError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "invalid_parameters" => StatusCode::UNPROCESSABLE_ENTITY,
            "insufficient_funds" => StatusCode::PAYMENT_REQUIRED,
            "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
            "model_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" | "cancelled" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.user_message(),
        }));
        (status, body).into_response()
    }
}

impl From<ForgeError> for ApiError {
    fn from(e: ForgeError) -> Self {
        Self(e)
    }
}

fn caller(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| ApiError(ForgeError::Validation("missing or malformed x-user-id".into())))
}

/// Job shape returned to callers. A dismissed error is omitted entirely.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: &'static str,
    pub model_reference: String,
    pub content_type: String,
    pub prompt: String,
    pub stage_index: usize,
    pub cost_charged: i64,
    pub artifacts: ArtifactRefs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        let error = record.error_detail.filter(|d| !d.dismissed);
        Self {
            id: record.id,
            status: record.status.as_str(),
            model_reference: record.request.model_reference,
            content_type: record.request.content_type,
            prompt: record.request.prompt,
            stage_index: record.stage_index,
            cost_charged: record.cost_charged,
            artifacts: record.artifact_refs,
            error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    model_reference: String,
    prompt: String,
    #[serde(default)]
    parameters: ParamMap,
}

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    let user_id = caller(&headers)?;
    let record = state
        .orchestrator
        .submit(NewJobRequest {
            user_id,
            model_reference: body.model_reference,
            prompt: body.prompt,
            parameters: body.parameters,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(record.into())))
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let user_id = caller(&headers)?;
    let jobs = state.orchestrator.list_jobs(user_id)?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let user_id = caller(&headers)?;
    Ok(Json(state.orchestrator.job(id, user_id)?.into()))
}

#[derive(Debug, Deserialize)]
struct ApproveBody {
    /// Which gate this request decides: `"script"` or `"voice"`. A
    /// replayed approve of an already-decided gate is a no-op instead of
    /// silently approving the next one.
    gate: Stage,
    #[serde(default)]
    edited_content: Option<String>,
}

async fn approve_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<JobView>, ApiError> {
    let user_id = caller(&headers)?;
    let record = state
        .orchestrator
        .approve(id, user_id, body.gate, body.edited_content)
        .await?;
    Ok(Json(record.into()))
}

#[derive(Debug, Deserialize)]
struct RejectBody {
    gate: Stage,
}

async fn reject_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> Result<Json<JobView>, ApiError> {
    let user_id = caller(&headers)?;
    Ok(Json(state
        .orchestrator
        .reject(id, user_id, body.gate)
        .await?
        .into()))
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let user_id = caller(&headers)?;
    Ok(Json(state.orchestrator.cancel(id, user_id).await?.into()))
}

async fn retry_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let user_id = caller(&headers)?;
    Ok(Json(state.orchestrator.retry(id, user_id).await?.into()))
}

async fn dismiss_error(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let user_id = caller(&headers)?;
    Ok(Json(state.orchestrator.dismiss_error(id, user_id)?.into()))
}

#[derive(Debug, Serialize)]
struct CreditsView {
    balance: i64,
}

async fn credits(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CreditsView>, ApiError> {
    let user_id = caller(&headers)?;
    let balance = state.orchestrator.ledger().balance(user_id)?;
    Ok(Json(CreditsView { balance }))
}

#[derive(Debug, Deserialize)]
struct GrantBody {
    amount: i64,
}

/// Credit purchase landing point. Opens the account on first grant.
async fn grant_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GrantBody>,
) -> Result<Json<CreditsView>, ApiError> {
    let user_id = caller(&headers)?;
    if body.amount <= 0 {
        return Err(ApiError(ForgeError::Validation(
            "grant amount must be positive".into(),
        )));
    }
    let ledger = state.orchestrator.ledger();
    ledger.open_account(user_id, 0)?;
    ledger.refund(user_id, body.amount, "credit grant", None);
    let balance = ledger.balance(user_id)?;
    Ok(Json(CreditsView { balance }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
