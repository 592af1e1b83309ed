//! Target-context resolution
//!
//! A target context id names a kubeconfig file under the configured
//! directory. Both helm (via `--kubeconfig`) and kube-rs clients are pointed
//! at that file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::model::validate_context_id;
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maps context ids to kubeconfig paths
#[derive(Clone, Debug)]
pub struct KubeContextResolver {
    dir: PathBuf,
}

impl KubeContextResolver {
    /// Resolve contexts under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Kubeconfig path for a context id
    ///
    /// Fails with a validation error for ids that are not plain file names or
    /// that have no kubeconfig.
    pub fn kubeconfig_path(&self, context: &str) -> Result<PathBuf> {
        validate_context_id(context)?;
        let path = self.dir.join(context);
        if !path.is_file() {
            return Err(Error::validation(
                "kube_cluster",
                format!("no kubeconfig found for '{}'", context),
            ));
        }
        Ok(path)
    }
}

/// Create a kube client from a kubeconfig path
///
/// Connections time out after 5s and reads after 30s.
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to read kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to load kubeconfig: {}", e))
        })?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn resolves_existing_context_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ctx-1"), "apiVersion: v1\nkind: Config\n").unwrap();

        let resolver = KubeContextResolver::new(dir.path());
        assert_eq!(
            resolver.kubeconfig_path("ctx-1").unwrap(),
            dir.path().join("ctx-1")
        );
    }

    #[test]
    fn unknown_and_unsafe_contexts_are_validation_errors() {
        let dir = TempDir::new().unwrap();
        let resolver = KubeContextResolver::new(dir.path());

        for id in ["ctx-2", "../etc/passwd", ""] {
            let err = resolver.kubeconfig_path(id).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{id:?}");
        }
    }

    #[tokio::test]
    async fn unreadable_kubeconfig_fails_client_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken");
        std::fs::write(&path, "not: [a kubeconfig").unwrap();
        let err = match create_client(&path).await {
            Ok(_) => panic!("broken kubeconfig must not yield a client"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("kubeconfig"));
    }
}
