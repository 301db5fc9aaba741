//! Job submission and query endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use quantum_core::{BaseRef, JobId, JobView, PrNumber};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/{id}", get(get_job))
        .route("/{id}/retry", post(retry_job))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    pr_number: PrNumber,
    /// Job id of the base; omitted or `null` means the trunk.
    #[serde(default)]
    base: BaseRef,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    id: JobId,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    if req.pr_number.get() == 0 {
        return Err(ApiError::BadRequest("pr_number must be positive".to_string()));
    }
    let id = state.scheduler.submit(req.pr_number, req.base).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id })))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobView>> {
    Json(state.scheduler.list_all())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.scheduler.get(&JobId::from(id))?;
    Ok(Json(job))
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.scheduler.retry(&JobId::from(id)).await?;
    Ok(Json(job))
}
