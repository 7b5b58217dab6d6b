use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use crate::types_jobs::ArtifactInfo;

const COPY_CHUNK: usize = 1 << 16;

/// Export artifacts on local disk, one directory per export:
/// `<root>/<export name>/<file name>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_for(&self, export: &str) -> PathBuf {
        self.root.join(export)
    }

    /// Copies `src` into the store while hashing it. The file only becomes
    /// visible under its final name once fully written; a failed copy leaves
    /// nothing behind.
    pub async fn store(&self, export: &str, file_name: &str, src: &Path) -> std::io::Result<ArtifactInfo> {
        let dir = self.dir_for(export);
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(".{}.partial", Uuid::new_v4()));

        let copied = match copy_hashed(src, &tmp).await {
            Ok(copied) => fs::rename(&tmp, dir.join(file_name)).await.map(|_| copied),
            Err(e) => Err(e),
        };
        let (size, digest) = match copied {
            Ok(c) => c,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(file = %tmp.display(), "failed to remove partial artifact: {rm}");
                    }
                }
                return Err(e);
            }
        };
        Ok(ArtifactInfo {
            file_name: file_name.to_string(),
            size,
            digest,
        })
    }

    /// Opens a stored artifact and returns it with its current length.
    pub async fn open(&self, export: &str, info: &ArtifactInfo) -> std::io::Result<(File, u64)> {
        let file = File::open(self.dir_for(export).join(&info.file_name)).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    pub async fn remove(&self, export: &str) -> std::io::Result<()> {
        match fs::remove_dir_all(self.dir_for(export)).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

async fn copy_hashed(src: &Path, dst: &Path) -> std::io::Result<(u64, String)> {
    let mut input = File::open(src).await?;
    let mut output = File::create(dst).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    output.sync_all().await?;
    Ok((size, format!("sha256:{}", hex::encode(hasher.finalize()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_open_remove() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("disk.qcow2");
        std::fs::write(&src, b"qcow2-bytes").unwrap();

        let store = ArtifactStore::new(root.path());
        let info = store.store("e1", "e1.qcow2", &src).await.unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(info.digest, ociref::Digest::of(b"qcow2-bytes").to_string());

        let (mut f, len) = store.open("e1", &info).await.unwrap();
        assert_eq!(len, 11);
        let mut body = Vec::new();
        f.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"qcow2-bytes");

        // Repeatable.
        assert!(store.open("e1", &info).await.is_ok());

        store.remove("e1").await.unwrap();
        assert!(store.open("e1", &info).await.is_err());
        store.remove("e1").await.unwrap();
    }

    #[tokio::test]
    async fn failed_copy_leaves_no_partial_file() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();

        let store = ArtifactStore::new(root.path());
        // A directory opens but cannot be read as a file.
        assert!(store.store("e1", "e1.iso", scratch.path()).await.is_err());

        let left: Vec<_> = std::fs::read_dir(root.path().join("e1")).unwrap().collect();
        assert!(left.is_empty(), "{left:?}");
    }
}
