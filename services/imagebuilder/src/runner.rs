use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::converter::ConvertError;
use crate::error::StoreError;
use crate::jobs;
use crate::logs::JobLog;
use crate::registry::RegistryError;
use crate::state::SharedState;
use crate::types_jobs::{JobEvent, JobKind, JobRecord, JobSpec};
use crate::{runner_build, runner_export};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("{0}")]
    Failed(String),

    #[error("state store: {0}")]
    Store(#[from] StoreError),
}

pub type RunResult<T> = std::result::Result<T, RunError>;

/// Everything a runner needs for one admitted job.
pub struct RunContext {
    pub state: SharedState,
    pub record: JobRecord,
    pub token: CancellationToken,
    pub log: Arc<JobLog>,
}

impl RunContext {
    pub fn kind(&self) -> JobKind {
        self.record.kind()
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Fails with `Canceled` once cancellation has been signaled.
    pub fn checkpoint(&self) -> RunResult<()> {
        if self.token.is_cancelled() {
            return Err(RunError::Canceled);
        }
        Ok(())
    }
}

/// Runs an admitted job to a terminal state in the background.
pub fn spawn(state: SharedState, record: JobRecord, token: CancellationToken) {
    tokio::spawn(async move {
        let kind = record.kind();
        let name = record.name().to_string();
        let log = state.logs.open(kind, &name);
        log.append(format!("{}: {}", record.status.condition.reason, record.status.condition.message));

        let stop_heartbeat = CancellationToken::new();
        spawn_heartbeat(state.clone(), kind, name.clone(), stop_heartbeat.clone());

        let ctx = RunContext { state: state.clone(), record, token, log };
        let outcome = match &ctx.record.spec {
            JobSpec::Build(spec) => runner_build::run(&ctx, spec.clone()).await,
            JobSpec::Export(spec) => runner_export::run(&ctx, spec.clone()).await,
        };
        stop_heartbeat.cancel();

        let event = match outcome {
            Ok(done) => done,
            Err(RunError::Canceled) => {
                info!(kind = %kind, job = %name, "runner: canceled");
                JobEvent::Canceled { message: None }
            }
            Err(e) => {
                warn!(kind = %kind, job = %name, "runner: failed: {e}");
                ctx.log.append(format!("error: {e}"));
                JobEvent::Failed { message: e.to_string() }
            }
        };

        match jobs::finish(&state, kind, &name, event).await {
            Ok(true) => {}
            // Somebody else (timeout, recovery) already finished the job.
            Ok(false) => {
                if let Some(token) = state.take_run(kind, &name).await {
                    token.cancel();
                    state.admission.pool(kind).release();
                }
            }
            Err(e) => error!(kind = %kind, job = %name, "runner: could not record outcome: {e}"),
        }
    });
}

fn spawn_heartbeat(state: SharedState, kind: JobKind, name: String, stop: CancellationToken) {
    let every = state.cfg.last_seen_interval;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(every) => {
                    if let Err(e) = jobs::advance(&state, kind, &name, JobEvent::Heartbeat).await {
                        warn!(kind = %kind, job = %name, "heartbeat failed: {e}");
                    }
                }
            }
        }
    });
}
