//! Artifact store
//!
//! Bundles are uploaded once after packaging and downloaded on every
//! start/restart. Keys are deterministic (`prefix + artifact name`), so an
//! upload to an existing key replaces it and the operation is idempotent.
//!
//! Two backends are provided:
//! - [`FsArtifactStore`] - a directory, typically a shared volume mount
//! - [`HttpArtifactStore`] - an HTTP object endpoint (PUT/GET per key)
//!
//! Neither backend retries; store failures are returned to the caller.

mod fs;
mod http;

use std::path::Path;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tempfile::TempPath;

pub use self::fs::FsArtifactStore;
pub use self::http::HttpArtifactStore;

use crate::{Error, Result};

/// Trait for remote bundle storage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Establish credentials/session. Idempotent and cheap to repeat.
    async fn configure(&self) -> Result<()>;

    /// Upload the file at `local` under `key`, returning its remote URL
    async fn upload(&self, local: &Path, key: &str) -> Result<String>;

    /// Download `key` into `local`
    ///
    /// Fails with `ArtifactNotFound` when the key does not exist.
    async fn download(&self, local: &Path, key: &str) -> Result<()>;
}

/// Reject keys that could escape the store root or form odd URLs
pub(crate) fn check_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(Error::store(key, "invalid store key"));
    }
    Ok(())
}

/// Write `bytes` to `local` via a sibling temp file so readers never see a
/// partial download
pub(crate) async fn write_atomically(local: &Path, key: &str, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::store(key, format!("cannot create {}: {}", parent.display(), e))
        })?;
    }
    let mut partial = local.as_os_str().to_owned();
    partial.push(".partial");
    // Removed on drop unless persisted, including when the caller goes away
    let partial = TempPath::from_path(std::path::PathBuf::from(partial));

    tokio::fs::write(&partial, bytes).await.map_err(|e| {
        Error::store(key, format!("cannot write {}: {}", partial.display(), e))
    })?;
    partial.persist(local).map_err(|e| {
        Error::store(key, format!("cannot move into {}: {}", local.display(), e.error))
    })
}
