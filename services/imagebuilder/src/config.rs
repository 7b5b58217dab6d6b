use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryMode {
    Http,
    Memory,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,

    pub max_concurrent_builds: usize,
    pub max_concurrent_exports: usize,
    pub system_reserved_slots: usize,

    pub promote_interval: Duration,
    pub job_timeout: Duration,
    pub timeout_check_interval: Duration,
    pub last_seen_interval: Duration,

    pub repositories_file: Option<PathBuf>,
    pub artifact_dir: PathBuf,
    pub converter_program: String,
    pub converter_workdir: PathBuf,

    pub registry_mode: RegistryMode,
    /// Images preloaded into the in-memory registry, as `host/name:tag`.
    pub memory_seed_images: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            max_concurrent_builds: 2,
            max_concurrent_exports: 2,
            system_reserved_slots: 1,
            promote_interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(3600),
            timeout_check_interval: Duration::from_secs(60),
            last_seen_interval: Duration::from_secs(30),
            repositories_file: None,
            artifact_dir: PathBuf::from("data/artifacts"),
            converter_program: "bootc-image-builder".to_string(),
            converter_workdir: PathBuf::from("data/convert"),
            registry_mode: RegistryMode::Http,
            memory_seed_images: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let bind_addr = std::env::var("IMAGEBUILDER_BIND_ADDR").unwrap_or(d.bind_addr);
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        let max_concurrent_builds = parse_or("MAX_CONCURRENT_BUILDS", d.max_concurrent_builds)?;
        let max_concurrent_exports = parse_or("MAX_CONCURRENT_EXPORTS", d.max_concurrent_exports)?;
        let system_reserved_slots = parse_or("SYSTEM_RESERVED_SLOTS", d.system_reserved_slots)?;

        let promote_interval = secs_or("PROMOTE_INTERVAL_SECS", d.promote_interval)?;
        let job_timeout = secs_or("JOB_TIMEOUT_SECS", d.job_timeout)?;
        let timeout_check_interval = secs_or("TIMEOUT_CHECK_INTERVAL_SECS", d.timeout_check_interval)?;
        let last_seen_interval = secs_or("LAST_SEEN_INTERVAL_SECS", d.last_seen_interval)?;

        let repositories_file = std::env::var("REPOSITORIES_FILE").ok().map(PathBuf::from);
        let artifact_dir = std::env::var("ARTIFACT_DIR").map(PathBuf::from).unwrap_or(d.artifact_dir);
        let converter_program = std::env::var("CONVERTER_PROGRAM").unwrap_or(d.converter_program);
        let converter_workdir = std::env::var("CONVERTER_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or(d.converter_workdir);

        let registry_mode = match std::env::var("REGISTRY_MODE").as_deref() {
            Err(_) | Ok("http") => RegistryMode::Http,
            Ok("memory") => RegistryMode::Memory,
            Ok(other) => bail!("REGISTRY_MODE must be 'http' or 'memory', got {other:?}"),
        };
        let memory_seed_images = std::env::var("MEMORY_SEED_IMAGES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // Fail fast on values the scheduler cannot work with.
        if max_concurrent_builds == 0 || max_concurrent_exports == 0 {
            bail!("MAX_CONCURRENT_BUILDS and MAX_CONCURRENT_EXPORTS must be at least 1");
        }
        if last_seen_interval >= job_timeout {
            bail!("LAST_SEEN_INTERVAL_SECS must be shorter than JOB_TIMEOUT_SECS");
        }

        Ok(Self {
            bind_addr,
            database_url,
            max_concurrent_builds,
            max_concurrent_exports,
            system_reserved_slots,
            promote_interval,
            job_timeout,
            timeout_check_interval,
            last_seen_interval,
            repositories_file,
            artifact_dir,
            converter_program,
            converter_workdir,
            registry_mode,
            memory_seed_images,
        })
    }
}

fn parse_or(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for env var {key}: {v:?}")),
        Err(_) => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    let secs = parse_or(key, default.as_secs() as usize)?;
    Ok(Duration::from_secs(secs as u64))
}
