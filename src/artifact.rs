//! Artifact storage.
//!
//! The store is an external collaborator in production; the local
//! filesystem implementation here backs the binary and the test suite.
//! Providers that support direct upload receive a pre-signed destination
//! so large payloads never round-trip through orchestrator memory.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ForgeError, Result};

/// Reference to one persisted artifact plus provider-reported metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    pub storage_path: String,
    pub url: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Cost the provider reported for this generation, in its own units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_cost: Option<f64>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist raw bytes; returns the storage path.
    async fn persist(&self, bytes: &[u8], content_type: &str) -> Result<String>;

    /// Resolvable URL for a stored path.
    fn public_url(&self, storage_path: &str) -> String;

    /// Pre-signed destination `(storage_path, upload_url)` for providers
    /// that upload directly.
    async fn presigned_destination(&self, content_type: &str) -> Result<(String, String)>;
}

/// Filesystem-backed store. Files are content-addressed by sha256 so
/// duplicate provider output is deduplicated for free.
pub struct LocalArtifactStore {
    root: PathBuf,
    base_url: String,
}

impl LocalArtifactStore {
    pub fn new(root: PathBuf, base_url: impl Into<String>) -> Self {
        Self {
            root,
            base_url: base_url.into(),
        }
    }

    fn extension(content_type: &str) -> &'static str {
        match content_type {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "audio/mpeg" => "mp3",
            "audio/wav" => "wav",
            "video/mp4" => "mp4",
            "text/plain" => "txt",
            _ => "bin",
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn persist(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        let hash = hex::encode(Sha256::digest(bytes));
        let name = format!("{hash}.{}", Self::extension(content_type));

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ForgeError::Storage(format!("create artifact dir: {e}")))?;
        let path = self.root.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ForgeError::Storage(format!("write artifact: {e}")))?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "artifact persisted");
        Ok(name)
    }

    fn public_url(&self, storage_path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), storage_path)
    }

    async fn presigned_destination(&self, content_type: &str) -> Result<(String, String)> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ForgeError::Storage(format!("create artifact dir: {e}")))?;
        let name = format!(
            "{}.{}",
            Uuid::new_v4(),
            Self::extension(content_type)
        );
        let upload_url = format!("file://{}", self.root.join(&name).display());
        Ok((name, upload_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path().to_path_buf(), "http://localhost/artifacts");

        let a = store.persist(b"same bytes", "image/png").await.unwrap();
        let b = store.persist(b"same bytes", "image/png").await.unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with(".png"));
        assert!(dir.path().join(&a).exists());
    }

    #[tokio::test]
    async fn public_url_is_resolvable_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path().to_path_buf(), "http://localhost/artifacts/");
        let path = store.persist(b"x", "video/mp4").await.unwrap();
        let url = store.public_url(&path);
        assert!(url.starts_with("http://localhost/artifacts/"));
        assert!(url.ends_with(".mp4"));
    }
}
