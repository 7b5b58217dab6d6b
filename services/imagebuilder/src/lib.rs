pub mod admission;
pub mod artifacts;
pub mod config;
pub mod converter;
pub mod error;
pub mod inject;
pub mod job_store;
pub mod job_store_pg;
pub mod jobs;
pub mod logs;
pub mod recovery;
pub mod registry;
pub mod registry_http;
pub mod repo_store;
pub mod routes_admin;
pub mod routes_jobs;
pub mod runner;
pub mod runner_build;
pub mod runner_export;
pub mod state;
pub mod timeouts;
pub mod types_jobs;
pub mod validation;
pub mod worker_loop;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::SharedState;
use crate::types_jobs::JobKind;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .merge(routes_jobs::job_routes(JobKind::Build))
        .merge(routes_jobs::job_routes(JobKind::Export))
        .merge(routes_admin::admin_routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Starts one promoter per pool and the timeout checker.
pub fn spawn_background(state: SharedState) {
    for kind in JobKind::ALL {
        tokio::spawn(worker_loop::run_promoter(state.clone(), kind));
    }
    tokio::spawn(timeouts::run_timeout_checker(state));
}
