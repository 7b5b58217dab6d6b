use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ServiceError;
use crate::repo_store::Repository;
use crate::routes_jobs::{create_job, CreateJobRequest};
use crate::state::SharedState;
use crate::types_jobs::{JobKind, JobOrigin, JobState};

pub fn admin_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/repositories", get(list_repositories))
        .route("/api/v1/admin/scheduler", get(get_scheduler_metrics))
        .route("/api/v1/admin/capacity", put(put_capacity))
        .route(
            "/api/v1/admin/imagebuilds",
            post(|st: State<SharedState>, body: Result<Json<CreateJobRequest>, JsonRejection>| {
                create_job(st, JobKind::Build, JobOrigin::System, body)
            }),
        )
        .route(
            "/api/v1/admin/imageexports",
            post(|st: State<SharedState>, body: Result<Json<CreateJobRequest>, JsonRejection>| {
                create_job(st, JobKind::Export, JobOrigin::System, body)
            }),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_repositories(State(state): State<SharedState>) -> Json<Vec<Repository>> {
    Json(state.repos.list().await)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub active: usize,
    pub pending: usize,
    pub capacity: usize,
    pub reserved: usize,
    /// Runners owned by this process.
    pub running: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub builds: PoolMetrics,
    pub exports: PoolMetrics,
}

async fn pool_metrics(state: &SharedState, kind: JobKind) -> Result<PoolMetrics, ServiceError> {
    let snap = state.admission.pool(kind).snapshot();
    let pending = state.jobs.count(kind, JobState::Pending).await?;
    Ok(PoolMetrics {
        active: snap.active,
        pending,
        capacity: snap.capacity,
        reserved: snap.reserved,
        running: state.running(kind).await,
    })
}

async fn get_scheduler_metrics(State(state): State<SharedState>) -> Result<Json<SchedulerMetrics>, ServiceError> {
    Ok(Json(SchedulerMetrics {
        builds: pool_metrics(&state, JobKind::Build).await?,
        exports: pool_metrics(&state, JobKind::Export).await?,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CapacityRequest {
    pub builds: Option<usize>,
    pub exports: Option<usize>,
    pub reserved: Option<usize>,
}

/// Live capacity change. Takes effect at the next admission decision.
async fn put_capacity(
    State(state): State<SharedState>,
    body: Result<Json<CapacityRequest>, JsonRejection>,
) -> Result<Json<SchedulerMetrics>, ServiceError> {
    let Json(req) = body.map_err(|e| ServiceError::Validation(vec![e.body_text()]))?;

    let mut errs = Vec::new();
    if req.builds == Some(0) {
        errs.push("builds: must be at least 1".to_string());
    }
    if req.exports == Some(0) {
        errs.push("exports: must be at least 1".to_string());
    }
    if !errs.is_empty() {
        return Err(ServiceError::Validation(errs));
    }

    for (kind, capacity) in [(JobKind::Build, req.builds), (JobKind::Export, req.exports)] {
        let pool = state.admission.pool(kind);
        if let Some(reserved) = req.reserved {
            pool.set_reserved(reserved);
        }
        if let Some(capacity) = capacity {
            pool.set_capacity(capacity);
        }
    }
    info!(builds = ?req.builds, exports = ?req.exports, reserved = ?req.reserved, "capacity updated");

    get_scheduler_metrics(State(state)).await
}
