use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::io::ReaderStream;

use crate::error::ServiceError;
use crate::job_store::{parse_label_selector, ListFilter};
use crate::jobs;
use crate::state::SharedState;
use crate::types_jobs::{BuildSpec, ExportSpec, JobKind, JobOrigin, JobRecord, JobSpec, JobState};

pub fn base_path(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Build => "/api/v1/imagebuilds",
        JobKind::Export => "/api/v1/imageexports",
    }
}

/// Resource routes for one job kind, mounted under [`base_path`].
pub fn job_routes(kind: JobKind) -> Router<SharedState> {
    let base = base_path(kind);
    let mut router = Router::new()
        .route(
            base,
            post(move |st: State<SharedState>, body: Result<Json<CreateJobRequest>, JsonRejection>| {
                create_job(st, kind, JobOrigin::User, body)
            })
            .get(move |st: State<SharedState>, q: Query<ListQuery>| list_jobs(st, kind, q)),
        )
        .route(
            &format!("{base}/:name"),
            get(move |st: State<SharedState>, p: Path<String>| get_job(st, kind, p))
                .delete(move |st: State<SharedState>, p: Path<String>| delete_job(st, kind, p)),
        )
        .route(
            &format!("{base}/:name/reason"),
            get(move |st: State<SharedState>, p: Path<String>| get_reason(st, kind, p)),
        )
        .route(
            &format!("{base}/:name/cancel"),
            post(move |st: State<SharedState>, p: Path<String>| cancel_job(st, kind, p)),
        )
        .route(
            &format!("{base}/:name/log"),
            get(move |st: State<SharedState>, p: Path<String>, q: Query<LogQuery>| get_log(st, kind, p, q)),
        );
    if kind == JobKind::Export {
        router = router.route(&format!("{base}/:name/download"), get(download_artifact));
    }
    router
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub metadata: CreateMetadata,
    #[serde(default)]
    pub spec: serde_json::Value,
}

fn parse_spec(kind: JobKind, raw: serde_json::Value) -> Result<JobSpec, ServiceError> {
    let raw = if raw.is_null() { serde_json::json!({}) } else { raw };
    let parsed = match kind {
        JobKind::Build => serde_json::from_value::<BuildSpec>(raw).map(JobSpec::Build),
        JobKind::Export => serde_json::from_value::<ExportSpec>(raw).map(JobSpec::Export),
    };
    parsed.map_err(|e| ServiceError::Validation(vec![format!("spec: {e}")]))
}

pub async fn create_job(
    State(state): State<SharedState>,
    kind: JobKind,
    origin: JobOrigin,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobRecord>), ServiceError> {
    let Json(req) = body.map_err(|e| ServiceError::Validation(vec![e.body_text()]))?;
    let spec = parse_spec(kind, req.spec)?;
    let record = jobs::create(&state, req.metadata.name, req.metadata.labels, spec, origin).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub label_selector: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct JobList {
    pub items: Vec<JobRecord>,
}

async fn list_jobs(
    State(state): State<SharedState>,
    kind: JobKind,
    Query(q): Query<ListQuery>,
) -> Result<Json<JobList>, ServiceError> {
    let labels = match q.label_selector.as_deref() {
        Some(raw) => parse_label_selector(raw).map_err(|e| ServiceError::Validation(vec![e]))?,
        None => BTreeMap::new(),
    };
    let filter = ListFilter { states: Vec::new(), labels, limit: q.limit };
    let items = jobs::list(&state, kind, &filter).await?;
    Ok(Json(JobList { items }))
}

async fn get_job(
    State(state): State<SharedState>,
    kind: JobKind,
    Path(name): Path<String>,
) -> Result<Json<JobRecord>, ServiceError> {
    Ok(Json(jobs::get(&state, kind, &name).await?))
}

async fn delete_job(
    State(state): State<SharedState>,
    kind: JobKind,
    Path(name): Path<String>,
) -> Result<Json<JobRecord>, ServiceError> {
    Ok(Json(jobs::delete(&state, kind, &name).await?))
}

async fn get_reason(
    State(state): State<SharedState>,
    kind: JobKind,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let record = jobs::get(&state, kind, &name).await?;
    Ok(Json(serde_json::json!({ "reason": record.status.condition.reason })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LifecycleResponse {
    pub status: jobs::CancelOutcome,
    pub message: String,
}

async fn cancel_job(
    State(state): State<SharedState>,
    kind: JobKind,
    Path(name): Path<String>,
) -> Result<Json<LifecycleResponse>, ServiceError> {
    let outcome = jobs::cancel(&state, kind, &name, None).await?;
    Ok(Json(LifecycleResponse { status: outcome, message: outcome.message().to_string() }))
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    #[serde(default)]
    pub follow: bool,
}

/// Accumulated log text. With `follow=true` the response stays open and
/// carries new lines until the job reaches a terminal state, including for
/// jobs still waiting to be admitted.
async fn get_log(
    State(state): State<SharedState>,
    kind: JobKind,
    Path(name): Path<String>,
    Query(q): Query<LogQuery>,
) -> Result<Response, ServiceError> {
    let text_plain = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];

    let live = match state.logs.get(kind, &name) {
        Some(log) => Some(log),
        // Pending jobs have no log yet; a follower opens it for the runner.
        None if q.follow => {
            let record = jobs::get(&state, kind, &name).await?;
            if record.state().is_terminal() {
                None
            } else {
                let log = state.logs.follow(kind, &name);
                if state.jobs.get(kind, &name).await?.is_none() {
                    // Deleted in between.
                    state.logs.forget(kind, &name);
                    return Err(ServiceError::NotFound { kind: kind.as_str(), name });
                }
                log
            }
        }
        None => None,
    };

    if let Some(log) = live {
        if !q.follow {
            return Ok((text_plain, log.snapshot()).into_response());
        }
        let (backlog, rx) = log.attach();
        drop(log);
        let live = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(line) => return Some((Ok::<_, Infallible>(format!("{line}\n")), rx)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        let body = futures_util::stream::once(async move { Ok::<_, Infallible>(backlog) }).chain(live);
        return Ok((text_plain, Body::from_stream(body)).into_response());
    }

    // Not running here: serve what the store kept, if the job exists.
    let record = jobs::get(&state, kind, &name).await?;
    let text = state.jobs.get_logs(kind, record.name()).await?.unwrap_or_default();
    Ok((text_plain, text).into_response())
}

async fn download_artifact(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Response, ServiceError> {
    let record = jobs::get(&state, JobKind::Export, &name).await?;
    let artifact = match (record.state(), record.status.artifact) {
        (JobState::Completed, Some(a)) => a,
        (s, _) => {
            return Err(ServiceError::NotReady(format!(
                "ImageExport {name:?} is {s}; the artifact is available once it is Completed"
            )))
        }
    };

    let (file, len) = state.artifacts.open(&name, &artifact).await?;
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_LENGTH, len.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.file_name),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}
