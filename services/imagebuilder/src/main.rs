use std::sync::Arc;

use anyhow::{Context, Result};
use ociref::ImageReference;
use sqlx::PgPool;
use tracing::{info, warn};

use imagebuilder::config::{AppConfig, RegistryMode};
use imagebuilder::converter::CommandConverter;
use imagebuilder::job_store::{JobStore, MemoryJobStore};
use imagebuilder::job_store_pg::PgJobStore;
use imagebuilder::recovery::recover_jobs;
use imagebuilder::registry::{Image, MemoryRegistry, RegistryClient};
use imagebuilder::registry_http::HttpRegistry;
use imagebuilder::repo_store::MemoryRepositoryStore;
use imagebuilder::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;

    // --- Job store ---
    let jobs: Arc<dyn JobStore> = match &cfg.database_url {
        Some(url) => {
            let pg_pool = PgPool::connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            sqlx::migrate!("./migrations")
                .run(&pg_pool)
                .await
                .context("Failed to run migrations")?;
            info!("job store: postgres");
            Arc::new(PgJobStore::new(pg_pool))
        }
        None => {
            warn!("DATABASE_URL not set; jobs are kept in memory only");
            Arc::new(MemoryJobStore::new())
        }
    };

    // --- Repositories ---
    let repos = match &cfg.repositories_file {
        Some(path) => MemoryRepositoryStore::from_file(path)?,
        None => {
            warn!("REPOSITORIES_FILE not set; no repositories are known");
            MemoryRepositoryStore::new(Vec::new())
        }
    };

    // --- Registry ---
    let registry: Arc<dyn RegistryClient> = match cfg.registry_mode {
        RegistryMode::Http => Arc::new(HttpRegistry::new().context("Failed to build HTTP client")?),
        RegistryMode::Memory => {
            let reg = MemoryRegistry::new();
            for raw in &cfg.memory_seed_images {
                let reference: ImageReference = raw
                    .parse()
                    .with_context(|| format!("MEMORY_SEED_IMAGES: invalid reference {raw:?}"))?;
                reg.insert(&reference, Image::sample(reference.name())).await;
                info!(image = %reference, "memory registry: seeded");
            }
            Arc::new(reg)
        }
    };

    let converter = Arc::new(CommandConverter::new(cfg.converter_program.clone()));

    let app_state = Arc::new(AppState::new(cfg.clone(), jobs, Arc::new(repos), registry, converter));

    // RECOVERY: finish jobs a previous process left active, before promoting.
    let report = recover_jobs(&app_state)
        .await
        .context("Job recovery failed")?;
    if !report.failed.is_empty() || !report.canceled.is_empty() {
        warn!(failed = ?report.failed, canceled = ?report.canceled, "recovered interrupted jobs");
    }

    imagebuilder::spawn_background(app_state.clone());

    let app = imagebuilder::router(app_state);

    let addr = &cfg.bind_addr;
    info!("imagebuilder listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
