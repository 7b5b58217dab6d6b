//! Job life-cycle operations shared by the API, the promoters, the runners
//! and the maintenance tasks. Every state change goes through the store's
//! atomic update, and the admission slot of a job is released by whoever wins
//! its terminal transition.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ServiceError, StoreResult};
use crate::job_store::{DeleteOutcome, ListFilter, Update};
use crate::state::AppState;
use crate::types_jobs::{
    JobEvent, JobKind, JobOrigin, JobRecord, JobSpec, JobState, MSG_CANCEL_REQUESTED,
};
use crate::validation;

pub async fn create(
    state: &AppState,
    name: String,
    labels: BTreeMap<String, String>,
    spec: JobSpec,
    origin: JobOrigin,
) -> Result<JobRecord, ServiceError> {
    let kind = spec.kind();
    let checked = match &spec {
        JobSpec::Build(s) => validation::validate_build(&name, s, state.repos.as_ref()).await,
        JobSpec::Export(s) => validation::validate_export(&name, s, state.jobs.as_ref()).await,
    };
    checked.map_err(ServiceError::Validation)?;

    let record = JobRecord::new(name, labels, origin, spec, Utc::now());
    state.jobs.insert(record.clone()).await?;
    info!(kind = %kind, job = %record.metadata.name, ?origin, "job created");

    state.admission.pool(kind).wake();
    Ok(record)
}

pub async fn get(state: &AppState, kind: JobKind, name: &str) -> Result<JobRecord, ServiceError> {
    state
        .jobs
        .get(kind, name)
        .await?
        .ok_or_else(|| not_found(kind, name))
}

pub async fn list(state: &AppState, kind: JobKind, filter: &ListFilter) -> Result<Vec<JobRecord>, ServiceError> {
    Ok(state.jobs.list(kind, filter).await?)
}

/// Pending and terminal jobs can be deleted; active ones must be canceled first.
pub async fn delete(state: &AppState, kind: JobKind, name: &str) -> Result<JobRecord, ServiceError> {
    match state.jobs.delete(kind, name).await? {
        DeleteOutcome::Deleted(record) => {
            state.logs.forget(kind, name);
            if kind == JobKind::Export {
                if let Err(e) = state.artifacts.remove(name).await {
                    warn!(job = %name, "failed to remove artifact: {e}");
                }
            }
            info!(kind = %kind, job = %name, "job deleted");
            Ok(record)
        }
        DeleteOutcome::Active(s) => Err(ServiceError::Conflict(format!(
            "{kind} {name:?} is {s}; cancel it before deleting"
        ))),
        DeleteOutcome::Missing => Err(not_found(kind, name)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Was pending; now terminal.
    Canceled,
    /// Running; the runner stops at its next checkpoint.
    CancelRequested,
    /// Already terminal.
    Noop,
}

impl CancelOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            CancelOutcome::Canceled => "Job was pending and is now canceled",
            CancelOutcome::CancelRequested => "Cancel requested for running job",
            CancelOutcome::Noop => "Job is already terminal",
        }
    }
}

/// Idempotent. `message` replaces the default condition message of a running job.
pub async fn cancel(
    state: &AppState,
    kind: JobKind,
    name: &str,
    message: Option<String>,
) -> Result<CancelOutcome, ServiceError> {
    let now = Utc::now();
    let request_msg = message.unwrap_or_else(|| MSG_CANCEL_REQUESTED.to_string());
    let mut outcome = CancelOutcome::Noop;

    let update = state
        .jobs
        .update(kind, name, &mut |r| match r.state() {
            JobState::Pending => {
                outcome = CancelOutcome::Canceled;
                r.apply(&JobEvent::Canceled { message: None }, now)
            }
            s if s.is_active() => {
                outcome = CancelOutcome::CancelRequested;
                r.apply(&JobEvent::CancelRequested { message: request_msg.clone() }, now)
            }
            _ => {
                outcome = CancelOutcome::Noop;
                false
            }
        })
        .await?;

    match update {
        Update::Missing => return Err(not_found(kind, name)),
        Update::Applied { previous, record } if record.state().is_terminal() => {
            on_terminal(state, previous, &record).await;
        }
        _ => {}
    }

    if outcome == CancelOutcome::CancelRequested {
        let signaled = state.signal_cancel(kind, name).await;
        info!(kind = %kind, job = %name, signaled, "cancel requested");
    }
    Ok(outcome)
}

/// Applies a non-terminal event and returns the record as stored afterwards.
pub async fn advance(
    state: &AppState,
    kind: JobKind,
    name: &str,
    event: JobEvent,
) -> StoreResult<Option<JobRecord>> {
    let now = Utc::now();
    Ok(match state.jobs.update(kind, name, &mut |r| r.apply(&event, now)).await? {
        Update::Missing => None,
        Update::Unchanged(r) | Update::Applied { record: r, .. } => Some(r),
    })
}

/// Moves the job to a terminal state. Returns `false` if it already was terminal.
pub async fn finish(state: &AppState, kind: JobKind, name: &str, event: JobEvent) -> StoreResult<bool> {
    let now = Utc::now();
    let update = state.jobs.update(kind, name, &mut |r| r.apply(&event, now)).await?;
    match update {
        Update::Applied { previous, record } if record.state().is_terminal() => {
            on_terminal(state, previous, &record).await;
            Ok(true)
        }
        _ => Ok(false),
    }
}

async fn on_terminal(state: &AppState, previous: JobState, record: &JobRecord) {
    let kind = record.kind();
    let name = record.name();
    let condition = &record.status.condition;
    info!(
        kind = %kind,
        job = %name,
        from = %previous,
        to = %record.state(),
        message = %condition.message,
        "job finished"
    );

    if let Some(log) = state.logs.close(kind, name) {
        log.append(format!("{}: {}", condition.reason, condition.message));
        if let Err(e) = state.jobs.save_logs(kind, name, &log.snapshot()).await {
            warn!(kind = %kind, job = %name, "failed to persist logs: {e}");
        }
    }

    let run = state.take_run(kind, name).await;
    if let Some(token) = &run {
        token.cancel();
    }
    if previous.is_active() && run.is_some() {
        state.admission.pool(kind).release();
    }
    if kind == JobKind::Build {
        // Exports may be waiting on this build.
        state.admission.pool(JobKind::Export).wake();
    }
}

fn not_found(kind: JobKind, name: &str) -> ServiceError {
    ServiceError::NotFound { kind: kind.as_str(), name: name.to_string() }
}
