use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use ociref::{
    Descriptor, Digest, ImageManifest, ImageReference, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_LAYER,
};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::repo_store::Repository;

/// Registry failures, classified by the operation that failed. The display
/// form always names the image reference and is shown to users verbatim.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("failed to pull image {reference}: {message}")]
    Pull { reference: String, message: String },

    #[error("failed to read manifest for {reference}: {message}")]
    Manifest { reference: String, message: String },

    #[error("failed to push image {reference}: {message}")]
    Push { reference: String, message: String },
}

impl RegistryError {
    pub fn pull(reference: &ImageReference, message: impl Into<String>) -> Self {
        Self::Pull { reference: reference.to_string(), message: message.into() }
    }

    pub fn manifest(reference: &ImageReference, message: impl Into<String>) -> Self {
        Self::Manifest { reference: reference.to_string(), message: message.into() }
    }

    pub fn push(reference: &ImageReference, message: impl Into<String>) -> Self {
        Self::Push { reference: reference.to_string(), message: message.into() }
    }
}

/// A single-platform image held in memory between pull and push.
#[derive(Debug, Clone)]
pub struct Image {
    pub manifest: ImageManifest,
    /// The manifest exactly as served; pushing it unchanged keeps the digest.
    pub manifest_bytes: Bytes,
    pub blobs: HashMap<Digest, Bytes>,
}

impl Image {
    pub fn from_parts(manifest: ImageManifest, blobs: HashMap<Digest, Bytes>) -> Self {
        let manifest_bytes = Bytes::from(manifest.to_bytes());
        Self { manifest, manifest_bytes, blobs }
    }

    pub fn digest(&self) -> Digest {
        Digest::of(&self.manifest_bytes)
    }

    /// Minimal one-layer image, used to seed development registries.
    pub fn sample(label: &str) -> Self {
        let mut config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Labels": { "org.opencontainers.image.title": label } },
            "rootfs": { "type": "layers", "diff_ids": [] },
        });
        let layer = Bytes::from(format!("layer for {label}").into_bytes());
        let layer_desc = Descriptor::for_blob(MEDIA_TYPE_IMAGE_LAYER, &layer);

        config["rootfs"]["diff_ids"] = serde_json::json!([layer_desc.digest.to_string()]);
        let config = Bytes::from(config.to_string().into_bytes());
        let config_desc = Descriptor::for_blob(MEDIA_TYPE_IMAGE_CONFIG, &config);

        let mut blobs = HashMap::new();
        blobs.insert(config_desc.digest.clone(), config);
        blobs.insert(layer_desc.digest.clone(), layer);
        Self::from_parts(ImageManifest::new(config_desc, vec![layer_desc]), blobs)
    }
}

/// OCI registry operations the build runner depends on.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn pull(&self, repo: &Repository, reference: &ImageReference) -> Result<Image, RegistryError>;

    /// Uploads missing blobs, then the manifest. Returns the manifest digest.
    async fn push(
        &self,
        repo: &Repository,
        reference: &ImageReference,
        image: &Image,
    ) -> Result<Digest, RegistryError>;
}

/// In-process registry keyed by the full reference string.
#[derive(Default)]
pub struct MemoryRegistry {
    images: RwLock<HashMap<String, Image>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, reference: &ImageReference, image: Image) {
        self.images.write().await.insert(reference.to_string(), image);
    }

    pub async fn get(&self, reference: &ImageReference) -> Option<Image> {
        self.images.read().await.get(&reference.to_string()).cloned()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn pull(&self, _repo: &Repository, reference: &ImageReference) -> Result<Image, RegistryError> {
        let image = self
            .get(reference)
            .await
            .ok_or_else(|| RegistryError::pull(reference, "manifest unknown"))?;
        for desc in image.manifest.blobs() {
            if !image.blobs.contains_key(&desc.digest) {
                return Err(RegistryError::pull(reference, format!("blob unknown {}", desc.digest)));
            }
        }
        Ok(image)
    }

    async fn push(
        &self,
        _repo: &Repository,
        reference: &ImageReference,
        image: &Image,
    ) -> Result<Digest, RegistryError> {
        for desc in image.manifest.blobs() {
            match image.blobs.get(&desc.digest) {
                Some(b) if desc.digest.matches(b) => {}
                Some(_) => {
                    return Err(RegistryError::push(reference, format!("digest mismatch for {}", desc.digest)))
                }
                None => return Err(RegistryError::push(reference, format!("missing blob {}", desc.digest))),
            }
        }
        self.insert(reference, image.clone()).await;
        Ok(image.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo_store::{AccessMode, Scheme};

    fn repo() -> Repository {
        Repository {
            name: "r".into(),
            registry: "registry.local".into(),
            scheme: Scheme::Https,
            access_mode: AccessMode::ReadWrite,
            skip_server_verification: false,
            credentials: None,
        }
    }

    #[tokio::test]
    async fn missing_image_error_names_reference() {
        let reg = MemoryRegistry::new();
        let r = ImageReference::new("registry.local", "does/not-exist", "v1").unwrap();
        let err = reg.pull(&repo(), &r).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("pull"), "{msg}");
        assert!(msg.contains("registry.local/does/not-exist:v1"), "{msg}");
    }

    #[tokio::test]
    async fn push_then_pull_keeps_digest() {
        let reg = MemoryRegistry::new();
        let r = ImageReference::new("registry.local", "os", "v1").unwrap();
        let image = Image::sample("os");
        let digest = reg.push(&repo(), &r, &image).await.unwrap();
        assert_eq!(digest, image.digest());
        let pulled = reg.pull(&repo(), &r).await.unwrap();
        assert_eq!(pulled.digest(), digest);
    }

    #[tokio::test]
    async fn push_rejects_incomplete_image() {
        let reg = MemoryRegistry::new();
        let r = ImageReference::new("registry.local", "os", "v1").unwrap();
        let mut image = Image::sample("os");
        image.blobs.clear();
        let err = reg.push(&repo(), &r, &image).await.unwrap_err();
        assert!(matches!(err, RegistryError::Push { .. }));
        assert!(reg.get(&r).await.is_none());
    }
}
