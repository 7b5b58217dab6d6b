use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::job_store::{ListFilter, Update};
use crate::jobs;
use crate::runner;
use crate::state::SharedState;
use crate::types_jobs::{JobEvent, JobKind, JobOrigin, JobRecord, JobSpec, JobState};

const RETRY_AFTER_ERROR: Duration = Duration::from_secs(1);

/// One promoter per pool. Wakes on job creation, slot release and build
/// completion, and rescans every `promote_interval` regardless.
pub async fn run_promoter(state: SharedState, kind: JobKind) {
    info!(pool = %kind, "promoter: started");
    let pool = state.admission.pool(kind);
    loop {
        let pause = match promote_pending(&state, kind).await {
            Ok(started) => {
                if started > 0 {
                    debug!(pool = %kind, started, "promoter: pass done");
                }
                state.cfg.promote_interval
            }
            Err(e) => {
                warn!(pool = %kind, "promoter: pass failed: {e}");
                RETRY_AFTER_ERROR
            }
        };
        tokio::select! {
            _ = pool.woken() => {}
            _ = sleep(pause) => {}
        }
    }
}

enum Readiness {
    Ready,
    Waiting,
    Broken(String),
}

async fn export_readiness(state: &SharedState, rec: &JobRecord) -> StoreResult<Readiness> {
    let JobSpec::Export(spec) = &rec.spec else {
        return Ok(Readiness::Ready);
    };
    let build = state.jobs.get(JobKind::Build, &spec.source_build_name).await?;
    Ok(match build.map(|b| b.state()) {
        Some(JobState::Completed) => Readiness::Ready,
        Some(s) if s.is_terminal() => Readiness::Broken(format!(
            "source ImageBuild {:?} did not complete: {s}",
            spec.source_build_name
        )),
        Some(_) => Readiness::Waiting,
        None => Readiness::Broken(format!(
            "source ImageBuild {:?} did not complete: not found",
            spec.source_build_name
        )),
    })
}

/// Walks the pool's Pending jobs oldest first and admits as many as capacity
/// allows. Once a user job is denied no later user job is admitted in the same
/// pass; system jobs behind it are still considered.
pub async fn promote_pending(state: &SharedState, kind: JobKind) -> StoreResult<usize> {
    let pool = state.admission.pool(kind);
    let pending = state.jobs.list(kind, &ListFilter::in_states(&[JobState::Pending])).await?;

    let mut started = 0;
    let mut user_blocked = false;
    for rec in pending {
        let origin = rec.metadata.origin;
        if origin == JobOrigin::User && user_blocked {
            continue;
        }

        match export_readiness(state, &rec).await? {
            Readiness::Ready => {}
            Readiness::Waiting => continue,
            Readiness::Broken(message) => {
                jobs::finish(state, kind, rec.name(), JobEvent::Failed { message }).await?;
                continue;
            }
        }

        if !pool.try_admit(origin) {
            match origin {
                JobOrigin::User => {
                    user_blocked = true;
                    continue;
                }
                JobOrigin::System => break,
            }
        }
        if start(state, &rec).await? {
            started += 1;
        }
    }
    Ok(started)
}

/// Moves an admitted job out of Pending and hands it to a runner. The slot
/// has already been taken.
async fn start(state: &SharedState, rec: &JobRecord) -> StoreResult<bool> {
    let kind = rec.kind();
    let name = rec.name();
    let pool = state.admission.pool(kind);

    // Registered before the transition so a cancel can always reach the runner.
    let token = state.register_run(kind, name).await;
    let now = chrono::Utc::now();
    let update = state.jobs.update(kind, name, &mut |r| r.apply(&JobEvent::Admitted, now)).await;

    match update {
        Ok(Update::Applied { record, .. }) => {
            info!(pool = %kind, job = %name, origin = ?record.metadata.origin, "job admitted");
            runner::spawn(state.clone(), record, token);
            Ok(true)
        }
        Ok(_) => {
            // Canceled or deleted while we were deciding.
            state.take_run(kind, name).await;
            pool.release();
            Ok(false)
        }
        Err(e) => {
            state.take_run(kind, name).await;
            pool.release();
            Err(e)
        }
    }
}
