//! Directory-backed artifact store

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{check_key, write_atomically, ArtifactStore};
use crate::{Error, Result};

/// Store that keeps each key as a file under a root directory
///
/// URLs returned by `upload` are `file://` URLs of the stored object.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn configure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::store(
                self.root.display().to_string(),
                format!("cannot create store root: {}", e),
            )
        })
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<String> {
        let object = self.object_path(key)?;
        let bytes = tokio::fs::read(local).await.map_err(|e| {
            Error::store(key, format!("cannot read {}: {}", local.display(), e))
        })?;
        write_atomically(&object, key, &bytes).await?;

        let absolute = tokio::fs::canonicalize(&object).await.unwrap_or(object);
        let url = format!("file://{}", absolute.display());
        info!(key, url = %url, bytes = bytes.len(), "Artifact uploaded");
        Ok(url)
    }

    async fn download(&self, local: &Path, key: &str) -> Result<()> {
        let object = self.object_path(key)?;
        let bytes = match tokio::fs::read(&object).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::artifact_not_found(key))
            }
            Err(e) => return Err(Error::store(key, e.to_string())),
        };
        write_atomically(local, key, &bytes).await?;
        debug!(key, local = %local.display(), "Artifact downloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn upload_then_download_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path().join("store"));
        store.configure().await.unwrap();
        // configure is idempotent
        store.configure().await.unwrap();

        let bundle = dir.path().join("bundle.tgz");
        std::fs::write(&bundle, [0x1f, 0x8b, 0x08, 0x00, 0xff]).unwrap();

        let url = store
            .upload(&bundle, "mlp/cluster_manager/bundle-v3")
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("mlp/cluster_manager/bundle-v3"));

        let copy = dir.path().join("staging/abc-bundle-v3");
        store
            .download(&copy, "mlp/cluster_manager/bundle-v3")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&copy).unwrap(), std::fs::read(&bundle).unwrap());
    }

    #[tokio::test]
    async fn missing_key_is_artifact_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let target = dir.path().join("out");
        let err = store
            .download(&target, "mlp/cluster_manager/none")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn reupload_replaces_content() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path().join("store"));
        let bundle = dir.path().join("b");

        std::fs::write(&bundle, "v1").unwrap();
        store.upload(&bundle, "k/a").await.unwrap();
        std::fs::write(&bundle, "v2").unwrap();
        store.upload(&bundle, "k/a").await.unwrap();

        let out = dir.path().join("o");
        store.download(&out, "k/a").await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "v2");
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path().join("store"));
        let bundle = dir.path().join("b");
        std::fs::write(&bundle, "x").unwrap();
        let err = store.upload(&bundle, "../escape").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
    }
}
