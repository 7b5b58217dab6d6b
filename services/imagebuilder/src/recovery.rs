use serde::Serialize;
use tracing::{info, warn};

use crate::error::StoreResult;
use crate::job_store::ListFilter;
use crate::jobs;
use crate::state::AppState;
use crate::types_jobs::{JobEvent, JobKind, JobState};

pub const MSG_RESTARTED: &str = "Job was in progress when the service restarted";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub failed: Vec<String>,
    pub canceled: Vec<String>,
}

/// Finishes jobs that were active when a previous process stopped. Must run
/// before the promoters start; no runner in this process owns those jobs.
/// Pending jobs are left for the promoters.
pub async fn recover_jobs(state: &AppState) -> StoreResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for kind in JobKind::ALL {
        let stale = state.jobs.list(kind, &ListFilter::in_states(&JobState::ACTIVE)).await?;
        for rec in stale {
            let name = rec.name().to_string();
            let (event, bucket) = if rec.status.cancel_requested {
                (JobEvent::Canceled { message: None }, &mut report.canceled)
            } else {
                (JobEvent::Failed { message: MSG_RESTARTED.to_string() }, &mut report.failed)
            };
            if jobs::finish(state, kind, &name, event).await? {
                warn!(kind = %kind, job = %name, was = %rec.state(), "recovered interrupted job");
                bucket.push(name);
            }
        }
    }
    info!(failed = report.failed.len(), canceled = report.canceled.len(), "recovery: done");
    Ok(report)
}
