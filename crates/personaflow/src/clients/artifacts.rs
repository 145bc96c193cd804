use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::error::ArtifactError;

/// Durable blob storage for raw and processed results.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key` and return a URI `download` accepts.
    /// Uploading the same key again overwrites it.
    async fn upload(&self, bytes: Bytes, key: &str) -> Result<String, ArtifactError>;

    async fn download(&self, uri: &str) -> Result<Bytes, ArtifactError>;
}

/// Deterministic key for a job's artifact.
pub fn job_artifact_key(job_id: &str, file_name: &str) -> String {
    format!("jobs/{job_id}/{file_name}")
}

/// Directory-backed `ArtifactStore` handing out `file://` URIs.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| ArtifactError::Unavailable(e.to_string()))?
                .join(root)
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        let rel = Path::new(key);
        let clean = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ArtifactError::InvalidUri(format!("bad artifact key {key:?}")));
        }
        Ok(self.root.join(rel))
    }

    fn path_for_uri(&self, uri: &str) -> Result<PathBuf, ArtifactError> {
        let raw = uri
            .strip_prefix("file://")
            .ok_or_else(|| ArtifactError::InvalidUri(uri.to_string()))?;
        let path = PathBuf::from(raw);

        let inside = path.starts_with(&self.root)
            && path
                .components()
                .all(|c| !matches!(c, Component::ParentDir));
        if !inside {
            return Err(ArtifactError::InvalidUri(uri.to_string()));
        }
        Ok(path)
    }
}

fn io_err(path: &Path, e: std::io::Error) -> ArtifactError {
    match e.kind() {
        ErrorKind::NotFound => ArtifactError::NotFound(path.display().to_string()),
        _ => ArtifactError::Unavailable(format!("{}: {e}", path.display())),
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn upload(&self, bytes: Bytes, key: &str) -> Result<String, ArtifactError> {
        let path = self.path_for_key(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| ArtifactError::InvalidUri(key.to_string()))?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ArtifactError::Unavailable(format!("{}: {e}", parent.display())))?;

        // write-then-rename so a reader never sees a partial file
        let tmp = parent.join(format!(".upload-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ArtifactError::Unavailable(format!("{}: {e}", tmp.display())))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ArtifactError::Unavailable(format!("{}: {e}", path.display())));
        }

        tracing::debug!(key, bytes = bytes.len(), "artifact stored");
        Ok(format!("file://{}", path.display()))
    }

    async fn download(&self, uri: &str) -> Result<Bytes, ArtifactError> {
        let path = self.path_for_uri(uri)?;
        let data = tokio::fs::read(&path).await.map_err(|e| io_err(&path, e))?;
        Ok(Bytes::from(data))
    }
}
