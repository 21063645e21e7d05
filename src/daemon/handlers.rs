//! HTTP handlers for the daemon's job API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::crd::{SnapShotStage, SnapShotState};
use crate::daemon::api::{
    CreateJobRequest, CreateJobResponse, ErrorResponse, JobListResponse, JobStatus,
};
use crate::daemon::jobs::{run_job, JobExecutor, JobStore};

/// Shared handler state: the job map plus the executor that performs a job's
/// external effects.
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobStore,
    pub executor: Arc<dyn JobExecutor>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("bad_request", message)),
    )
}

/// `POST /oci`: register a job and start the build+push task.
///
/// The job record is inserted before the response is written so an immediate
/// `GET /oci/{id}` always finds it.
#[instrument(skip(state, request))]
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    request.validate().map_err(|reason| bad_request(&reason))?;

    let id = Uuid::now_v7();
    state.jobs.insert(
        id,
        JobStatus::new(SnapShotStage::Formatting, SnapShotState::Started),
    );
    info!(job_id = %id, image = %request.image_reference, "accepted oci job");

    tokio::spawn(run_job(
        state.jobs.clone(),
        state.executor.clone(),
        id,
        request,
    ));

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: id.to_string(),
        }),
    ))
}

/// `GET /oci/{id}`: status of one job, 404 when the id is unknown (including
/// after a daemon restart, which drops all jobs).
#[instrument(skip(state))]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let id: Uuid = id
        .parse()
        .map_err(|_| bad_request("job id is not a uuid"))?;

    match state.jobs.get(&id) {
        Some(status) => Ok(Json(status)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "unknown job id")),
        )),
    }
}

/// `GET /oci`: all known jobs.
#[instrument(skip(state))]
pub async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    Json(JobListResponse {
        jobs: state.jobs.list(),
    })
}

/// `GET /healthz`
pub async fn healthz() -> &'static str {
    "OK"
}
