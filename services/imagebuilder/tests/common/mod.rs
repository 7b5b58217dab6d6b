#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ociref::{Digest, ImageReference};
use tokio::sync::Semaphore;

use imagebuilder::config::AppConfig;
use imagebuilder::converter::{ConvertError, ConvertRequest, ImageConverter};
use imagebuilder::job_store::MemoryJobStore;
use imagebuilder::logs::JobLog;
use imagebuilder::registry::{Image, MemoryRegistry, RegistryClient, RegistryError};
use imagebuilder::repo_store::{AccessMode, MemoryRepositoryStore, Repository, Scheme};
use imagebuilder::state::{AppState, SharedState};
use imagebuilder::types_jobs::{
    BuildSpec, ExportFormat, ExportSpec, ImageTarget, JobKind, JobOrigin, JobRecord, JobSpec, JobState,
};

pub const SRC_REGISTRY: &str = "src.local";
pub const DST_REGISTRY: &str = "dst.local";

/// Memory registry whose pulls can be held open until released.
pub struct GatedRegistry {
    pub inner: MemoryRegistry,
    gate: Option<Semaphore>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub pulls: AtomicUsize,
}

impl GatedRegistry {
    pub fn open() -> Self {
        Self::build(None)
    }

    /// Every pull waits for one [`release`](Self::release) permit.
    pub fn gated() -> Self {
        Self::build(Some(Semaphore::new(0)))
    }

    fn build(gate: Option<Semaphore>) -> Self {
        Self {
            inner: MemoryRegistry::new(),
            gate,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
        }
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub async fn seed(&self, name: &str, tag: &str) {
        let r = ImageReference::new(SRC_REGISTRY, name, tag).unwrap();
        self.inner.insert(&r, Image::sample(name)).await;
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryClient for GatedRegistry {
    async fn pull(&self, repo: &Repository, reference: &ImageReference) -> Result<Image, RegistryError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.inner.pull(repo, reference).await
    }

    async fn push(&self, repo: &Repository, reference: &ImageReference, image: &Image) -> Result<Digest, RegistryError> {
        self.inner.push(repo, reference, image).await
    }
}

/// Writes a small deterministic artifact where the real converter would.
pub struct FakeConverter {
    gate: Option<Semaphore>,
    empty_output: bool,
    pub calls: AtomicUsize,
}

impl FakeConverter {
    pub fn open() -> Self {
        Self { gate: None, empty_output: false, calls: AtomicUsize::new(0) }
    }

    pub fn gated() -> Self {
        Self { gate: Some(Semaphore::new(0)), ..Self::open() }
    }

    /// Exits cleanly but leaves a zero-byte disk image.
    pub fn empty_output() -> Self {
        Self { empty_output: true, ..Self::open() }
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }
}

pub fn artifact_bytes(image_reference: &str, format: ExportFormat) -> Vec<u8> {
    format!("{}-disk-of-{image_reference}", format.as_str()).into_bytes()
}

#[async_trait]
impl ImageConverter for FakeConverter {
    async fn convert(&self, req: ConvertRequest<'_>, log: Arc<JobLog>) -> Result<PathBuf, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        log.append(format!("fake converter: {}", req.image_reference));
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| ConvertError::Other(e.to_string()))?
                .forget();
        }
        let out = req.output_dir.join(req.format.output_path());
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = if self.empty_output {
            Vec::new()
        } else {
            artifact_bytes(req.image_reference, req.format)
        };
        tokio::fs::write(&out, bytes).await?;
        Ok(out)
    }
}

pub fn repositories() -> MemoryRepositoryStore {
    MemoryRepositoryStore::new([
        Repository {
            name: "src".into(),
            registry: SRC_REGISTRY.into(),
            scheme: Scheme::Https,
            access_mode: AccessMode::Read,
            skip_server_verification: false,
            credentials: None,
        },
        Repository {
            name: "dst".into(),
            registry: DST_REGISTRY.into(),
            scheme: Scheme::Https,
            access_mode: AccessMode::ReadWrite,
            skip_server_verification: false,
            credentials: None,
        },
    ])
}

pub struct Harness {
    pub state: SharedState,
    pub registry: Arc<GatedRegistry>,
    pub converter: Arc<FakeConverter>,
    _dir: tempfile::TempDir,
}

pub fn test_config(dir: &std::path::Path) -> AppConfig {
    AppConfig {
        max_concurrent_builds: 2,
        max_concurrent_exports: 2,
        system_reserved_slots: 1,
        promote_interval: Duration::from_millis(50),
        last_seen_interval: Duration::from_millis(100),
        artifact_dir: dir.join("artifacts"),
        converter_workdir: dir.join("work"),
        ..AppConfig::default()
    }
}

/// State over in-memory collaborators. Background loops are not started.
pub fn harness_with(
    cfg: impl FnOnce(AppConfig) -> AppConfig,
    registry: GatedRegistry,
    converter: FakeConverter,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(test_config(dir.path()));
    let registry = Arc::new(registry);
    let converter = Arc::new(converter);
    let state = Arc::new(AppState::new(
        cfg,
        Arc::new(MemoryJobStore::new()),
        Arc::new(repositories()),
        registry.clone(),
        converter.clone(),
    ));
    Harness { state, registry, converter, _dir: dir }
}

pub fn harness() -> Harness {
    harness_with(|c| c, GatedRegistry::open(), FakeConverter::open())
}

pub fn build_spec(image: &str, tag: &str) -> JobSpec {
    JobSpec::Build(BuildSpec {
        source: ImageTarget { repository: "src".into(), image_name: image.into(), image_tag: tag.into() },
        destination: ImageTarget {
            repository: "dst".into(),
            image_name: format!("built/{image}"),
            image_tag: tag.into(),
        },
        ..BuildSpec::default()
    })
}

pub fn export_spec(build: &str, format: ExportFormat) -> JobSpec {
    JobSpec::Export(ExportSpec { source_build_name: build.into(), format: Some(format) })
}

pub async fn create(h: &Harness, name: &str, spec: JobSpec) -> JobRecord {
    imagebuilder::jobs::create(&h.state, name.into(), BTreeMap::new(), spec, JobOrigin::User)
        .await
        .unwrap()
}

pub async fn create_system(h: &Harness, name: &str, spec: JobSpec) -> JobRecord {
    imagebuilder::jobs::create(&h.state, name.into(), BTreeMap::new(), spec, JobOrigin::System)
        .await
        .unwrap()
}

pub async fn state_of(h: &Harness, kind: JobKind, name: &str) -> JobState {
    imagebuilder::jobs::get(&h.state, kind, name).await.unwrap().state()
}

/// Polls until the job satisfies `pred`, panicking after a few seconds.
pub async fn wait_for(h: &Harness, kind: JobKind, name: &str, pred: impl Fn(&JobRecord) -> bool) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let rec = imagebuilder::jobs::get(&h.state, kind, name).await.unwrap();
        if pred(&rec) {
            return rec;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("{kind} {name}: timed out waiting, last status {:?}", rec.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(h: &Harness, kind: JobKind, name: &str, want: JobState) -> JobRecord {
    wait_for(h, kind, name, |r| r.state() == want).await
}

/// Waits until `pred` holds for the registry counters.
pub async fn wait_until(mut pred: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
