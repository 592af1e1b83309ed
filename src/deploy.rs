//! Deployment controller
//!
//! Issues helm release transitions against a target cluster:
//!
//! ```text
//! Absent -> Installing -> Running -> (Upgrading | Restarting) -> Running -> Deleting -> Absent
//! ```
//!
//! The state machine is observed on the Kubernetes side only; nothing here
//! tracks it. Install/upgrade is retried under a [`RetryPolicy`] when helm
//! fails for a transient reason. Restart and delete are single-shot.
//! Deleting a release that does not exist succeeds.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::helm::{HelmError, HelmOutput, HelmRunner};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::{Error, Result};

/// stderr fragments that mark a helm failure as transient
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "i/o timeout",
    "tls handshake timeout",
    "context deadline exceeded",
    "unexpected eof",
    "the object has been modified",
    "conflict",
    "another operation (install/upgrade/rollback) is in progress",
    "failed calling webhook",
    "etcdserver: request timed out",
    "too many requests",
    "service unavailable",
    "http2: client connection lost",
];

/// stderr fragment helm prints when a release is absent
const RELEASE_NOT_FOUND: &str = "release: not found";

/// A release as reported by helm after a transition
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseRef {
    /// Release name
    pub name: String,
    /// Release namespace
    pub namespace: String,
    /// helm revision, when helm reported one
    pub revision: Option<u64>,
}

/// Trait for issuing release transitions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseDeployer: Send + Sync {
    /// Install the release, or upgrade it if it exists
    async fn install_or_upgrade(
        &self,
        kubeconfig: &Path,
        bundle: &Path,
        release: &str,
        namespace: &str,
    ) -> Result<ReleaseRef>;

    /// Uninstall the release; absent releases are a no-op
    async fn delete(&self, kubeconfig: &Path, release: &str, namespace: &str) -> Result<()>;

    /// Re-apply the bundle with a rollout-triggering change
    async fn restart(
        &self,
        kubeconfig: &Path,
        bundle: &Path,
        release: &str,
        namespace: &str,
    ) -> Result<ReleaseRef>;
}

/// Whether a helm failure is worth retrying
pub fn is_transient(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m))
}

#[derive(Deserialize)]
struct HelmReleaseJson {
    #[serde(default)]
    version: Option<u64>,
}

/// Deployment controller backed by the helm CLI
pub struct DeploymentController {
    helm: Arc<dyn HelmRunner>,
    retry: RetryPolicy,
    restart_annotation: String,
}

impl DeploymentController {
    /// Create a controller
    ///
    /// `restart_annotation` is the values path set to the current timestamp
    /// on restart (e.g. `podAnnotations.restartedAt`).
    pub fn new(
        helm: Arc<dyn HelmRunner>,
        retry: RetryPolicy,
        restart_annotation: impl Into<String>,
    ) -> Self {
        Self {
            helm,
            retry,
            restart_annotation: restart_annotation.into(),
        }
    }

    fn release_ref(release: &str, namespace: &str, output: &HelmOutput) -> ReleaseRef {
        let revision = serde_json::from_str::<HelmReleaseJson>(output.stdout.trim())
            .ok()
            .and_then(|r| r.version);
        ReleaseRef {
            name: release.to_string(),
            namespace: namespace.to_string(),
            revision,
        }
    }

    fn upgrade_args(kubeconfig: &Path, bundle: &Path, release: &str, namespace: &str) -> Vec<String> {
        vec![
            "upgrade".to_string(),
            release.to_string(),
            bundle.display().to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--kubeconfig".to_string(),
            kubeconfig.display().to_string(),
            "--output".to_string(),
            "json".to_string(),
        ]
    }

    /// Run helm once; a failure is a single-attempt deployment error
    async fn attempt(&self, release: &str, args: Vec<String>) -> Result<HelmOutput> {
        let output = self.helm.run(args).await.map_err(|e| {
            let transient = matches!(e, HelmError::TimedOut(_));
            Error::deployment(release, e.to_string(), transient)
        })?;
        if output.success {
            Ok(output)
        } else {
            let message = output.stderr.trim();
            Err(Error::deployment(release, message, is_transient(message)))
        }
    }
}

#[async_trait]
impl ReleaseDeployer for DeploymentController {
    async fn install_or_upgrade(
        &self,
        kubeconfig: &Path,
        bundle: &Path,
        release: &str,
        namespace: &str,
    ) -> Result<ReleaseRef> {
        let mut args = Self::upgrade_args(kubeconfig, bundle, release, namespace);
        args.push("--install".to_string());

        let result = retry_with_policy(
            &self.retry,
            "helm_install_or_upgrade",
            Error::is_retryable,
            || self.attempt(release, args.clone()),
        )
        .await;

        match result {
            Ok(output) => {
                let release_ref = Self::release_ref(release, namespace, &output);
                info!(release, namespace, revision = ?release_ref.revision, "Release installed");
                Ok(release_ref)
            }
            Err(e) => {
                let attempts = e.attempts();
                Err(match e.into_inner() {
                    Error::Deployment {
                        release,
                        message,
                        transient,
                        ..
                    } => Error::Deployment {
                        release,
                        attempts,
                        message,
                        transient,
                    },
                    other => other,
                })
            }
        }
    }

    async fn delete(&self, kubeconfig: &Path, release: &str, namespace: &str) -> Result<()> {
        let args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--kubeconfig".to_string(),
            kubeconfig.display().to_string(),
        ];
        match self.attempt(release, args).await {
            Ok(_) => {
                info!(release, namespace, "Release deleted");
                Ok(())
            }
            Err(Error::Deployment { message, .. })
                if message.to_ascii_lowercase().contains(RELEASE_NOT_FOUND) =>
            {
                info!(release, namespace, "Release already absent, nothing to delete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn restart(
        &self,
        kubeconfig: &Path,
        bundle: &Path,
        release: &str,
        namespace: &str,
    ) -> Result<ReleaseRef> {
        let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        // The bundle already carries the merged values; only the stamp changes
        let mut args = Self::upgrade_args(kubeconfig, bundle, release, namespace);
        args.extend([
            "--set-string".to_string(),
            format!("{}={}", self.restart_annotation, stamp),
        ]);

        match self.attempt(release, args).await {
            Ok(output) => {
                let release_ref = Self::release_ref(release, namespace, &output);
                info!(release, namespace, restarted_at = %stamp, "Release restarted");
                Ok(release_ref)
            }
            Err(e) => {
                warn!(release, namespace, error = %e, "Release restart failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helm::MockHelmRunner;
    use crate::ErrorKind;
    use mockall::Sequence;
    use std::path::PathBuf;
    use std::time::Duration;

    fn kubeconfig() -> PathBuf {
        PathBuf::from("/configs/ctx-1")
    }

    fn bundle() -> PathBuf {
        PathBuf::from("/tmp/artifacts/1234-bundle-v3")
    }

    fn controller(helm: MockHelmRunner, attempts: u32) -> DeploymentController {
        DeploymentController::new(
            Arc::new(helm),
            RetryPolicy::fixed(attempts, Duration::from_secs(1)),
            "podAnnotations.restartedAt",
        )
    }

    #[test]
    fn transient_markers_are_case_insensitive() {
        assert!(is_transient("Error: read tcp: Connection Reset by peer"));
        assert!(is_transient(
            "Error: UPGRADE FAILED: another operation (install/upgrade/rollback) is in progress"
        ));
        assert!(is_transient("Internal error occurred: failed calling webhook \"x\": timeout"));
        assert!(!is_transient("Error: template: ray/templates/head.yaml:3: bad character"));
        assert!(!is_transient("Error: chart requires kubeVersion: >=1.30"));
    }

    // ==========================================================================
    // Story: install/upgrade with bounded retry
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_install_succeeds_once_transient_failures_stop() {
        let mut helm = MockHelmRunner::new();
        let mut seq = Sequence::new();
        helm.expect_run()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HelmOutput::failed("Error: connection reset by peer")));
        helm.expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|args| {
                args[0] == "upgrade"
                    && args[1] == "ml-job-1"
                    && args.contains(&"--install".to_string())
                    && args.contains(&"ns-a".to_string())
                    && args.contains(&"/configs/ctx-1".to_string())
            })
            .returning(|_| Ok(HelmOutput::ok(r#"{"name":"ml-job-1","version":4}"#)));

        let release = controller(helm, 3)
            .install_or_upgrade(&kubeconfig(), &bundle(), "ml-job-1", "ns-a")
            .await
            .unwrap();

        assert_eq!(release.name, "ml-job-1");
        assert_eq!(release.namespace, "ns-a");
        assert_eq!(release.revision, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn story_persistent_transient_failures_exhaust_the_ceiling() {
        let mut helm = MockHelmRunner::new();
        helm.expect_run()
            .times(3)
            .returning(|_| Ok(HelmOutput::failed("Error: Operation cannot be fulfilled: the object has been modified")));

        let err = controller(helm, 3)
            .install_or_upgrade(&kubeconfig(), &bundle(), "ml-job-1", "ns-a")
            .await
            .unwrap_err();

        match err {
            Error::Deployment {
                attempts, message, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("object has been modified"));
            }
            other => panic!("expected deployment error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn story_invalid_chart_fails_without_retry() {
        let mut helm = MockHelmRunner::new();
        helm.expect_run()
            .times(1)
            .returning(|_| Ok(HelmOutput::failed("Error: INSTALLATION FAILED: validation: chart.metadata.name is required")));

        let err = controller(helm, 5)
            .install_or_upgrade(&kubeconfig(), &bundle(), "ml-job-1", "ns-a")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Deployment);
        assert!(!err.is_retryable());
        assert!(matches!(err, Error::Deployment { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn story_helm_timeouts_are_retried() {
        let mut helm = MockHelmRunner::new();
        let mut seq = Sequence::new();
        helm.expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(HelmError::TimedOut(Duration::from_secs(300))));
        helm.expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HelmOutput::ok("")));

        let release = controller(helm, 2)
            .install_or_upgrade(&kubeconfig(), &bundle(), "ml-job-1", "ns-a")
            .await
            .unwrap();
        assert_eq!(release.revision, None);
    }

    // ==========================================================================
    // Story: idempotent delete
    // ==========================================================================

    #[tokio::test]
    async fn story_deleting_an_absent_release_is_a_noop() {
        let mut helm = MockHelmRunner::new();
        helm.expect_run()
            .times(1)
            .withf(|args| args[0] == "uninstall" && args[1] == "ml-job-1")
            .returning(|_| Ok(HelmOutput::failed("Error: uninstall: Release not loaded: ml-job-1: release: not found")));

        controller(helm, 3)
            .delete(&kubeconfig(), "ml-job-1", "ns-a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_delete_failures_surface_immediately() {
        let mut helm = MockHelmRunner::new();
        helm.expect_run()
            .times(1)
            .returning(|_| Ok(HelmOutput::failed("Error: Kubernetes cluster unreachable: connection refused")));

        let err = controller(helm, 3)
            .delete(&kubeconfig(), "ml-job-1", "ns-a")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deployment);
    }

    // ==========================================================================
    // Story: restart forces a rollout without changing configuration
    // ==========================================================================

    #[tokio::test]
    async fn story_restart_applies_bundle_values_and_bumps_the_annotation() {
        let mut helm = MockHelmRunner::new();
        helm.expect_run()
            .times(1)
            .withf(|args| {
                args[0] == "upgrade"
                    && args[2] == "/tmp/artifacts/1234-bundle-v3"
                    && !args.contains(&"--install".to_string())
                    && !args.contains(&"--reuse-values".to_string())
                    && !args.contains(&"--reset-then-reuse-values".to_string())
                    && args.contains(&"--set-string".to_string())
                    && args
                        .iter()
                        .any(|a| a.starts_with("podAnnotations.restartedAt=20"))
            })
            .returning(|_| Ok(HelmOutput::ok(r#"{"version":7}"#)));

        let release = controller(helm, 3)
            .restart(&kubeconfig(), &bundle(), "ml-job-1", "ns-a")
            .await
            .unwrap();
        assert_eq!(release.revision, Some(7));
    }

    #[tokio::test]
    async fn story_restart_is_not_retried() {
        let mut helm = MockHelmRunner::new();
        helm.expect_run()
            .times(1)
            .returning(|_| Ok(HelmOutput::failed("Error: connection reset by peer")));

        let err = controller(helm, 3)
            .restart(&kubeconfig(), &bundle(), "ml-job-1", "ns-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Deployment { attempts: 1, transient: true, .. }));
    }

    #[tokio::test]
    async fn story_helm_that_cannot_start_is_not_retried() {
        let mut helm = MockHelmRunner::new();
        helm.expect_run()
            .times(1)
            .returning(|_| {
                Err(HelmError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "No such file or directory",
                )))
            });

        let err = controller(helm, 3)
            .install_or_upgrade(&kubeconfig(), &bundle(), "ml-job-1", "ns-a")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, Error::Deployment { attempts: 1, transient: false, .. }));
    }
}
