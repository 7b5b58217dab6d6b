use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "Read",
            AccessMode::ReadWrite => "ReadWrite",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

/// An OCI registry location jobs may pull from or push to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub name: String,
    /// Registry host with optional port, e.g. `quay.io` or `registry.local:5000`.
    pub registry: String,
    #[serde(default)]
    pub scheme: Scheme,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub skip_server_verification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl Repository {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.registry)
    }
}

/// Read-only view of the configured repositories.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn get(&self, name: &str) -> Option<Repository>;
    async fn list(&self) -> Vec<Repository>;
}

#[derive(Default)]
pub struct MemoryRepositoryStore {
    repos: RwLock<HashMap<String, Repository>>,
}

impl MemoryRepositoryStore {
    pub fn new(repos: impl IntoIterator<Item = Repository>) -> Self {
        Self {
            repos: RwLock::new(repos.into_iter().map(|r| (r.name.clone(), r)).collect()),
        }
    }

    /// Loads a JSON array of repositories.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read repositories file {}", path.display()))?;
        let repos: Vec<Repository> = serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid repositories file {}", path.display()))?;
        for r in &repos {
            if !ociref::is_valid_registry(&r.registry) {
                anyhow::bail!("repository {:?} has an invalid registry host {:?}", r.name, r.registry);
            }
        }
        Ok(Self::new(repos))
    }

    pub async fn upsert(&self, repo: Repository) {
        self.repos.write().await.insert(repo.name.clone(), repo);
    }
}

#[async_trait]
impl RepositoryStore for MemoryRepositoryStore {
    async fn get(&self, name: &str) -> Option<Repository> {
        self.repos.read().await.get(name).cloned()
    }

    async fn list(&self) -> Vec<Repository> {
        let mut all: Vec<_> = self.repos.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
