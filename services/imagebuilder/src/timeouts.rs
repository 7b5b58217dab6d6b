use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::job_store::ListFilter;
use crate::jobs;
use crate::state::SharedState;
use crate::types_jobs::{JobEvent, JobKind, JobState};

pub async fn run_timeout_checker(state: SharedState) {
    info!(every = ?state.cfg.timeout_check_interval, timeout = ?state.cfg.job_timeout, "timeout checker: started");
    loop {
        sleep(state.cfg.timeout_check_interval).await;
        match check_timeouts(&state, Utc::now()).await {
            Ok(0) => {}
            Ok(n) => info!(jobs = n, "timeout checker: acted on stale jobs"),
            Err(e) => warn!("timeout checker: {e}"),
        }
    }
}

/// Cancels active jobs not seen for longer than the job timeout. A job that
/// was already asked to cancel and is still stale is finished as Canceled
/// directly. Returns how many jobs were acted on.
pub async fn check_timeouts(state: &SharedState, now: DateTime<Utc>) -> Result<usize, ServiceError> {
    let timeout = state.cfg.job_timeout;
    let mut acted = 0;

    for kind in JobKind::ALL {
        let active = state.jobs.list(kind, &ListFilter::in_states(&JobState::ACTIVE)).await?;
        for rec in active {
            let seen = rec.status.last_seen.unwrap_or(rec.status.condition.last_transition_time);
            match now.signed_duration_since(seen).to_std() {
                Ok(age) if age > timeout => {}
                _ => continue,
            }
            let name = rec.name();
            if rec.status.cancel_requested {
                warn!(kind = %kind, job = %name, "stale after cancel request; forcing Canceled");
                if jobs::finish(state, kind, name, JobEvent::Canceled { message: None }).await? {
                    acted += 1;
                }
            } else {
                let message = format!("Operation timed out: last seen more than {} ago", human_duration(timeout));
                warn!(kind = %kind, job = %name, "{message}");
                jobs::cancel(state, kind, name, Some(message)).await?;
                acted += 1;
            }
        }
    }
    Ok(acted)
}

/// Largest whole unit: `90m` stays `90m`, `3600s` becomes `1h`.
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_use_largest_whole_unit() {
        assert_eq!(human_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(human_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(human_duration(Duration::from_secs(5400)), "90m");
        assert_eq!(human_duration(Duration::from_secs(45)), "45s");
        assert_eq!(human_duration(Duration::from_secs(0)), "0s");
    }
}
