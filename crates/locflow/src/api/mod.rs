use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::models::JobListItem;
use crate::jobs::model::{ClonePayload, Stage};
use crate::jobs::queue::JobsRepo;

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobsRepo,
    pub max_attempts: i32,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/count-lines", post(intake))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/dlq", get(list_dlq))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn internal_err(e: anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: format!("internal error: {e}"),
        }),
    )
}

// ----------------------------
// Intake
// ----------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeRequest {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IntakeResponse {
    pub message: &'static str,
    pub job_id: Uuid,
    pub run_id: Uuid,
}

/// 202-style acceptance: validate, enqueue one clone job, return the handle.
/// The actual work happens in the background pipeline.
pub async fn intake(
    State(state): State<ApiState>,
    Json(req): Json<IntakeRequest>,
) -> Result<(StatusCode, Json<IntakeResponse>), (StatusCode, Json<ErrorBody>)> {
    let (user_id, token) = validate_intake(&req).map_err(|msg| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody { error: msg.into() }),
        )
    })?;

    let run_id = Uuid::new_v4();
    let payload = ClonePayload {
        user_id,
        token,
        email: req.email.filter(|e| !e.trim().is_empty()),
        run_id,
    };

    let job_id = state
        .jobs
        .enqueue_stage(Stage::Clone, &payload, state.max_attempts)
        .await
        .map_err(internal_err)?;

    tracing::info!(user_id = %payload.user_id, %job_id, %run_id, "accepted count-lines request");

    Ok((
        StatusCode::ACCEPTED,
        Json(IntakeResponse {
            message: "Counting lines in the background. Check your email soon for the total.",
            job_id,
            run_id,
        }),
    ))
}

/// The user id becomes a path component of the workspace, so it gets the
/// same treatment as untrusted repository names.
fn validate_intake(req: &IntakeRequest) -> Result<(String, String), &'static str> {
    let user_id = req.user_id.trim();
    let token = req.token.trim();

    if user_id.is_empty() || token.is_empty() {
        return Err("token and userId are required");
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("userId must contain only letters, digits, '-' and '_'");
    }

    Ok((user_id.to_string(), token.to_string()))
}

// ----------------------------
// Inspection
// ----------------------------

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub queue: String,
    pub status: String,
    pub run_at: chrono::DateTime<chrono::Utc>,
    pub max_attempts: i32,
    pub last_error_code: Option<String>,
    pub dlq_reason_code: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

pub async fn get_job(Path(id): Path<Uuid>, State(state): State<ApiState>) -> impl IntoResponse {
    match state.jobs.get_job(id).await {
        Ok(Some(job)) => (
            StatusCode::OK,
            Json(JobStatusResponse {
                id: job.id,
                queue: job.queue,
                status: job.status,
                run_at: job.run_at,
                max_attempts: job.max_attempts,
                last_error_code: job.last_error_code,
                dlq_reason_code: job.dlq_reason_code,
                created_at: job.created_at,
                updated_at: job.updated_at,
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "job not found".into(),
            }),
        )
            .into_response(),
        Err(e) => internal_err(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub queue: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobListItem>>, (StatusCode, Json<ErrorBody>)> {
    let items = state
        .jobs
        .list_jobs(q.queue.as_deref(), q.status.as_deref(), q.limit.unwrap_or(100))
        .await
        .map_err(internal_err)?;
    Ok(Json(items))
}

pub async fn list_dlq(
    State(state): State<ApiState>,
    Query(mut q): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobListItem>>, (StatusCode, Json<ErrorBody>)> {
    q.status = Some("dlq".to_string());
    list_jobs(State(state), Query(q)).await
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
