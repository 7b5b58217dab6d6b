use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::admission::Admission;
use crate::artifacts::ArtifactStore;
use crate::config::AppConfig;
use crate::converter::ImageConverter;
use crate::job_store::JobStore;
use crate::logs::LogHub;
use crate::registry::RegistryClient;
use crate::repo_store::RepositoryStore;
use crate::types_jobs::JobKind;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub cfg: AppConfig,
    pub jobs: Arc<dyn JobStore>,
    pub repos: Arc<dyn RepositoryStore>,
    pub registry: Arc<dyn RegistryClient>,
    pub converter: Arc<dyn ImageConverter>,
    pub artifacts: ArtifactStore,
    pub admission: Admission,
    pub logs: LogHub,
    /// Jobs admitted by this process. An entry owns one admission slot.
    runs: RwLock<HashMap<(JobKind, String), CancellationToken>>,
}

impl AppState {
    pub fn new(
        cfg: AppConfig,
        jobs: Arc<dyn JobStore>,
        repos: Arc<dyn RepositoryStore>,
        registry: Arc<dyn RegistryClient>,
        converter: Arc<dyn ImageConverter>,
    ) -> Self {
        let admission = Admission::new(
            cfg.max_concurrent_builds,
            cfg.max_concurrent_exports,
            cfg.system_reserved_slots,
        );
        Self {
            artifacts: ArtifactStore::new(cfg.artifact_dir.clone()),
            cfg,
            jobs,
            repos,
            registry,
            converter,
            admission,
            logs: LogHub::new(),
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_run(&self, kind: JobKind, name: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.runs
            .write()
            .await
            .insert((kind, name.to_string()), token.clone());
        token
    }

    /// Removes the run entry. Only one caller ever gets `Some`.
    pub async fn take_run(&self, kind: JobKind, name: &str) -> Option<CancellationToken> {
        self.runs.write().await.remove(&(kind, name.to_string()))
    }

    /// Signals the runner, if this process is running the job.
    pub async fn signal_cancel(&self, kind: JobKind, name: &str) -> bool {
        match self.runs.read().await.get(&(kind, name.to_string())) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn running(&self, kind: JobKind) -> usize {
        self.runs.read().await.keys().filter(|(k, _)| *k == kind).count()
    }
}
