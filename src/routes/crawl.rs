use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::crawl::{CrawlAccepted, CrawlRequest, JobView};
use crate::routes::error::ApiError;
use crate::services::submit;

/// POST /crawl: queue a URL for analysis.
///
/// Answers `202` with the job id, which is the id of an already running job
/// for the same URL when one is still fresh.
pub async fn submit_crawl(
    State(state): State<AppState>,
    body: Result<Json<CrawlRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CrawlAccepted>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidUrl(e.body_text()))?;
    request
        .validate()
        .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

    let submitted = submit::submit(
        state.store.as_ref(),
        state.queue.as_ref(),
        &request.url,
        state.freshness_window,
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CrawlAccepted { id: submitted.id }),
    ))
}

/// GET /crawl/{id}: current state of a job.
pub async fn get_crawl(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound)?;

    let job = state
        .store
        .find(id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %id, error = %e, "Failed to load job");
            ApiError::Unavailable
        })?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(JobView::from(&job)))
}
