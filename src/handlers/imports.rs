//! Import job endpoints: creation, inspection, review and finalize.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::handlers::CurrentUser;
use crate::models::{
    extract_playlist_id, Candidate, Classification, ImportItem, ImportJob, ImportReport, JobStage,
    JobState, Provider, SourceTrack,
};
use crate::services::orchestrator::build_target_catalog;
use crate::services::store::{ItemStats, ReviewDecision};
use crate::AppState;

const MANUAL_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
pub struct CreateImportRequest {
    pub playlist_url: String,
    pub target_provider: Provider,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub state: JobState,
    pub source_playlist_id: String,
    pub source_playlist_name: Option<String>,
    pub target_provider: Provider,
    pub target_playlist_id: Option<String>,
    pub error_message: Option<String>,
    pub report: Option<ImportReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ImportJob> for JobResponse {
    fn from(job: ImportJob) -> Self {
        Self {
            id: job.id,
            state: job.state,
            source_playlist_id: job.source_playlist_id,
            source_playlist_name: job.source_playlist_name,
            target_provider: job.target_provider,
            target_playlist_id: job.target_playlist_id,
            error_message: job.error_message,
            report: job.report,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: JobResponse,
    pub stats: ItemStats,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
}

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub id: Uuid,
    pub position: i32,
    pub source_track: SourceTrack,
    pub best_match: Option<Candidate>,
    pub classification: Classification,
    pub selected_target_id: Option<String>,
}

impl From<ImportItem> for ItemResponse {
    fn from(item: ImportItem) -> Self {
        Self {
            id: item.id,
            position: item.position,
            source_track: item.source_track,
            best_match: item.best_match,
            classification: item.classification,
            selected_target_id: item.selected_target_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReviewListResponse {
    pub items: Vec<ItemResponse>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub decisions: Vec<ReviewDecision>,
}

#[derive(Debug, Serialize)]
pub struct ReviewResponse {
    pub applied: usize,
}

#[derive(Debug, Deserialize)]
pub struct ManualSearchRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct ManualSearchResponse {
    pub results: Vec<Candidate>,
}

async fn owned_job(state: &AppState, job_id: Uuid, user_id: Uuid) -> Result<ImportJob> {
    state
        .store
        .job_for_user(job_id, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("job".to_string()))
}

/// POST /api/v1/imports
///
/// Validates the playlist reference and required connections, persists a
/// QUEUED job and dispatches the match stage.
pub async fn create_import_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateImportRequest>,
) -> Result<(StatusCode, Json<JobResponse>)> {
    let playlist_id = extract_playlist_id(&request.playlist_url)
        .ok_or_else(|| AppError::BadRequest("invalid playlist URL".to_string()))?;
    if !request.target_provider.is_target() {
        return Err(AppError::BadRequest(format!(
            "{} is not a migration target",
            request.target_provider
        )));
    }

    // Fail fast on missing connections instead of mid-job.
    if state.store.connection(user.id, Provider::Spotify).await?.is_none() {
        return Err(AppError::AuthMissing(Provider::Spotify));
    }
    if state
        .store
        .connection(user.id, request.target_provider)
        .await?
        .is_none()
    {
        return Err(AppError::AuthMissing(request.target_provider));
    }

    let job = state
        .store
        .create_job(user.id, &playlist_id, request.target_provider)
        .await?;
    state.queue.enqueue(job.id, JobStage::Match);
    tracing::info!(job_id = %job.id, user_id = %user.id, target = %job.target_provider, "import job created");

    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

/// GET /api/v1/imports
pub async fn list_imports_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<JobListResponse>> {
    let jobs = state
        .store
        .jobs_for_user(user.id)
        .await?
        .into_iter()
        .map(JobResponse::from)
        .collect();
    Ok(Json(JobListResponse { jobs }))
}

/// GET /api/v1/imports/:id
pub async fn get_import_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>> {
    let job = owned_job(&state, job_id, user.id).await?;
    let stats = state.store.item_stats(job_id).await?;
    Ok(Json(JobDetailResponse {
        job: job.into(),
        stats,
    }))
}

/// GET /api/v1/imports/:id/review
///
/// Uncertain and not-found items, with their scored candidate when the
/// matcher kept one.
pub async fn review_list_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ReviewListResponse>> {
    owned_job(&state, job_id, user.id).await?;
    let items = state
        .store
        .review_items(job_id)
        .await?
        .into_iter()
        .map(ItemResponse::from)
        .collect();
    Ok(Json(ReviewListResponse { items }))
}

/// POST /api/v1/imports/:id/review
pub async fn apply_review_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<Uuid>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<ReviewResponse>> {
    let job = owned_job(&state, job_id, user.id).await?;
    if job.state.is_terminal() {
        return Err(AppError::InvalidState {
            expected: JobState::WaitingReview,
            actual: job.state,
        });
    }
    let applied = state.store.apply_decisions(job_id, &request.decisions).await?;
    tracing::info!(job_id = %job_id, applied, "review decisions applied");
    Ok(Json(ReviewResponse { applied }))
}

/// POST /api/v1/imports/:id/search
///
/// Manual target-catalog search so the reviewer can hunt for a replacement
/// candidate the automatic search never surfaced.
pub async fn manual_search_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<Uuid>,
    Json(request): Json<ManualSearchRequest>,
) -> Result<Json<ManualSearchResponse>> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(AppError::BadRequest("search query cannot be empty".to_string()));
    }
    let job = owned_job(&state, job_id, user.id).await?;
    let catalog = build_target_catalog(&state.store, user.id, job.target_provider).await?;
    let results = catalog.search(query, MANUAL_SEARCH_LIMIT).await?;
    Ok(Json(ManualSearchResponse { results }))
}

/// POST /api/v1/imports/:id/finalize
///
/// Moves WAITING_REVIEW to IMPORTING and dispatches the finalize stage.
/// Items still UNCERTAIN at this point are excluded, never implicitly
/// accepted.
pub async fn finalize_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobResponse>)> {
    let job = owned_job(&state, job_id, user.id).await?;
    if !state
        .store
        .transition(job_id, JobState::WaitingReview, JobState::Importing)
        .await?
    {
        return Err(AppError::InvalidState {
            expected: JobState::WaitingReview,
            actual: job.state,
        });
    }
    state.queue.enqueue(job_id, JobStage::Finalize);
    tracing::info!(job_id = %job_id, "finalize enqueued");

    let job = owned_job(&state, job_id, user.id).await?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

/// POST /api/v1/imports/:id/cancel
///
/// A job actively running either stage moves to FAILED with a "canceled"
/// reason; in-flight work observes it at the next guarded write.
pub async fn cancel_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>> {
    let job = owned_job(&state, job_id, user.id).await?;
    if !matches!(job.state, JobState::Running | JobState::Importing) {
        return Err(AppError::InvalidState {
            expected: JobState::Running,
            actual: job.state,
        });
    }
    state.store.fail_job(job_id, "canceled").await?;
    let job = owned_job(&state, job_id, user.id).await?;
    Ok(Json(job.into()))
}
