//! Cluster lifecycle orchestration
//!
//! [`ClusterManager`] composes the packager, artifact store, deployment
//! controller and resource inspector into the lifecycle operations:
//!
//! | Operation | Steps |
//! |---|---|
//! | create / update | package -> configure store -> upload |
//! | start | configure store -> download to unique staging path -> install or upgrade |
//! | stop | delete release |
//! | restart | configure store -> download to unique staging path -> restart |
//! | status | inspect release pods |
//! | list | list releases in namespace |
//!
//! A failing step aborts the rest and its error is returned unchanged.
//! Completed steps are not rolled back. Local files created along the way
//! are removed afterwards whether the operation succeeded or not; removal
//! failures are logged and never returned. Each local file is also owned by
//! a [`TempPath`] guard, so an operation whose future is dropped mid-step
//! still removes its files.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempPath;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ManagerConfig;
use crate::deploy::{DeploymentController, ReleaseDeployer, ReleaseRef};
use crate::helm::{HelmCli, HelmRunner};
use crate::inspect::{KubePodSource, PodSource, ResourceInspector};
use crate::kube_context::KubeContextResolver;
use crate::lock::{LockKey, ReleaseGuard, ReleaseLocks};
use crate::model::{
    validate_artifact_name, validate_release_name, BundleArtifact, Cluster,
    ClusterStatusSummary, DeploymentTarget, ReleaseListingEntry,
};
use crate::packager::{BundlePackager, HelmPackager};
use crate::store::ArtifactStore;
use crate::{Error, Result};

// =============================================================================
// Request context
// =============================================================================

/// Per-request identity, cancellation and deadline
///
/// Every external call made on behalf of a request runs under
/// [`RequestContext::run`], so a cancelled or expired request stops at the
/// next step boundary or mid-step.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context with no deadline and its own cancellation token
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Use `token` for cancellation
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Expire `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Request id for log correlation
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Cancellation token of this request
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one step, failing with `Cancelled` or `Timeout` if the request
    /// ends first
    pub async fn run<T, F>(&self, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                step: step.to_string(),
            });
        }
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled { step: step.to_string() }),
            _ = deadline => Err(Error::Timeout { step: step.to_string() }),
            result = fut => result,
        }
    }
}

// =============================================================================
// Local cleanup
// =============================================================================

/// Outcome of best-effort removal of local files
#[derive(Debug, Default, PartialEq)]
pub struct CleanupReport {
    /// Paths that were removed
    pub removed: Vec<PathBuf>,
    /// Paths that could not be removed, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    /// Whether every path is gone
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remove local files; missing files count as removed
pub async fn cleanup_local(operation: &str, paths: &[&Path]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in paths {
        let result = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => report.removed.push(path.to_path_buf()),
            Err(e) => {
                warn!(
                    operation,
                    path = %path.display(),
                    error = %e,
                    "Local cleanup failed, continuing"
                );
                report.failed.push((path.to_path_buf(), e.to_string()));
            }
        }
    }
    report
}

// =============================================================================
// Cluster manager
// =============================================================================

/// How a downloaded bundle is applied
#[derive(Clone, Copy, Debug)]
enum Rollout {
    Install,
    Restart,
}

impl Rollout {
    fn operation(self) -> &'static str {
        match self {
            Rollout::Install => "start",
            Rollout::Restart => "restart",
        }
    }
}

/// Lifecycle orchestrator, constructed once at startup and shared by handlers
pub struct ClusterManager {
    config: Arc<ManagerConfig>,
    packager: Arc<dyn BundlePackager>,
    store: Arc<dyn ArtifactStore>,
    deployer: Arc<dyn ReleaseDeployer>,
    inspector: ResourceInspector,
    contexts: KubeContextResolver,
    locks: ReleaseLocks,
}

impl ClusterManager {
    /// Start building a manager from configuration
    pub fn builder(config: ManagerConfig) -> ClusterManagerBuilder {
        ClusterManagerBuilder::new(config)
    }

    /// Active configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Local path for a bundle, unique per call
    ///
    /// Two operations on the same artifact name never share a file, so one
    /// operation's cleanup cannot remove another's in-flight bundle.
    fn staging_path(&self, artifact_name: &str) -> PathBuf {
        self.config
            .artifacts_dir
            .join(format!("{}-{}", uuid::Uuid::new_v4(), artifact_name))
    }

    async fn lock(&self, ctx: &RequestContext, key: LockKey) -> Result<ReleaseGuard> {
        ctx.run("acquire lock", async { Ok(self.locks.acquire(key).await) })
            .await
    }

    /// Package a cluster's bundle from its overlay and upload it
    ///
    /// Returns the cluster with `artifact_url` set. The local bundle and the
    /// overlay file are removed afterwards.
    pub async fn create(&self, ctx: &RequestContext, cluster: Cluster) -> Result<Cluster> {
        self.publish(ctx, cluster, "create").await
    }

    /// Re-package and re-upload the bundle of an existing cluster
    ///
    /// Same contract as [`ClusterManager::create`].
    pub async fn update(&self, ctx: &RequestContext, cluster: Cluster) -> Result<Cluster> {
        self.publish(ctx, cluster, "update").await
    }

    async fn publish(
        &self,
        ctx: &RequestContext,
        mut cluster: Cluster,
        operation: &str,
    ) -> Result<Cluster> {
        let _overlay = TempPath::from_path(&cluster.overlay_path);
        if let Err(e) = cluster.validate() {
            cleanup_local(operation, &[&cluster.overlay_path]).await;
            return Err(e);
        }

        let bundle = BundleArtifact::new(
            self.staging_path(&cluster.artifact_name),
            self.config.store_key(&cluster.artifact_name),
        );
        let _staging = TempPath::from_path(bundle.path());
        let result = self.package_and_upload(ctx, &cluster, &bundle).await;
        cleanup_local(operation, &[bundle.path(), &cluster.overlay_path]).await;

        let url = result?;
        info!(
            request_id = ctx.request_id(),
            operation,
            cluster = %cluster.name,
            artifact = %cluster.artifact_name,
            url = %url,
            "Cluster bundle published"
        );
        cluster.artifact_url = Some(url);
        Ok(cluster)
    }

    async fn package_and_upload(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        bundle: &BundleArtifact,
    ) -> Result<String> {
        let _guard = self
            .lock(ctx, LockKey::Artifact(cluster.artifact_name.clone()))
            .await?;

        let packaged = ctx
            .run(
                "package",
                self.packager
                    .package(&self.config.chart_path, &cluster.overlay_path, bundle.path()),
            )
            .await?;
        ctx.run("configure store", self.store.configure()).await?;
        ctx.run("upload", self.store.upload(&packaged, &bundle.store_key))
            .await
    }

    /// Download a bundle and install or upgrade it as release `name`
    pub async fn start(
        &self,
        ctx: &RequestContext,
        name: &str,
        artifact_name: &str,
        target: &DeploymentTarget,
    ) -> Result<ReleaseRef> {
        self.deploy_bundle(ctx, name, artifact_name, target, Rollout::Install)
            .await
    }

    /// Download a bundle and restart release `name` with it
    ///
    /// The staging copy is removed afterwards, as for start.
    pub async fn restart(
        &self,
        ctx: &RequestContext,
        name: &str,
        artifact_name: &str,
        target: &DeploymentTarget,
    ) -> Result<ReleaseRef> {
        self.deploy_bundle(ctx, name, artifact_name, target, Rollout::Restart)
            .await
    }

    async fn deploy_bundle(
        &self,
        ctx: &RequestContext,
        name: &str,
        artifact_name: &str,
        target: &DeploymentTarget,
        rollout: Rollout,
    ) -> Result<ReleaseRef> {
        let operation = rollout.operation();
        validate_release_name(name)?;
        validate_artifact_name(artifact_name)?;
        let kubeconfig = self.contexts.kubeconfig_path(&target.context)?;
        let _guard = self
            .lock(ctx, LockKey::release(name, &target.namespace, &target.context))
            .await?;

        ctx.run("configure store", self.store.configure()).await?;

        let bundle = BundleArtifact::new(
            self.staging_path(artifact_name),
            self.config.store_key(artifact_name),
        );
        let _staging = TempPath::from_path(bundle.path());
        let staging = bundle.path();
        info!(
            request_id = ctx.request_id(),
            operation,
            cluster = name,
            artifact = artifact_name,
            staging = %staging.display(),
            "Staging bundle"
        );

        let result = async {
            ctx.run("download", self.store.download(staging, &bundle.store_key))
                .await?;
            match rollout {
                Rollout::Install => {
                    ctx.run(
                        "install or upgrade",
                        self.deployer
                            .install_or_upgrade(&kubeconfig, staging, name, &target.namespace),
                    )
                    .await
                }
                Rollout::Restart => {
                    ctx.run(
                        "restart",
                        self.deployer
                            .restart(&kubeconfig, staging, name, &target.namespace),
                    )
                    .await
                }
            }
        }
        .await;
        cleanup_local(operation, &[staging]).await;

        let release = result?;
        info!(
            request_id = ctx.request_id(),
            operation,
            cluster = name,
            namespace = %target.namespace,
            context = %target.context,
            revision = ?release.revision,
            "Cluster deployed"
        );
        Ok(release)
    }

    /// Delete release `name`; succeeds if it is already gone
    pub async fn stop(
        &self,
        ctx: &RequestContext,
        name: &str,
        target: &DeploymentTarget,
    ) -> Result<()> {
        validate_release_name(name)?;
        let kubeconfig = self.contexts.kubeconfig_path(&target.context)?;
        let _guard = self
            .lock(ctx, LockKey::release(name, &target.namespace, &target.context))
            .await?;

        ctx.run(
            "delete",
            self.deployer.delete(&kubeconfig, name, &target.namespace),
        )
        .await?;
        info!(
            request_id = ctx.request_id(),
            cluster = name,
            namespace = %target.namespace,
            context = %target.context,
            "Cluster stopped"
        );
        Ok(())
    }

    /// Current status of release `name`
    pub async fn status(
        &self,
        ctx: &RequestContext,
        name: &str,
        target: &DeploymentTarget,
    ) -> Result<ClusterStatusSummary> {
        validate_release_name(name)?;
        let kubeconfig = self.contexts.kubeconfig_path(&target.context)?;
        ctx.run(
            "status",
            self.inspector
                .get_status(&kubeconfig, name, &target.namespace),
        )
        .await
    }

    /// Releases in `namespace` of target context `context`
    pub async fn list(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        context: &str,
    ) -> Result<Vec<ReleaseListingEntry>> {
        if namespace.is_empty() {
            return Err(Error::validation("namespace", "no namespace specified"));
        }
        if context.is_empty() {
            return Err(Error::validation("kube_cluster", "no kube cluster specified"));
        }
        let target = DeploymentTarget::new(namespace, context)?;
        let kubeconfig = self.contexts.kubeconfig_path(&target.context)?;
        let selector = self.config.listing_selector();
        ctx.run(
            "list",
            self.inspector.list_releases(
                &kubeconfig,
                &target.namespace,
                &selector,
                &self.config.release_label,
                ctx.request_id(),
            ),
        )
        .await
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ClusterManager`]
///
/// Collaborators not supplied default to the helm- and kube-backed
/// implementations. The artifact store has no default.
pub struct ClusterManagerBuilder {
    config: ManagerConfig,
    helm: Option<Arc<dyn HelmRunner>>,
    packager: Option<Arc<dyn BundlePackager>>,
    store: Option<Arc<dyn ArtifactStore>>,
    deployer: Option<Arc<dyn ReleaseDeployer>>,
    pod_source: Option<Arc<dyn PodSource>>,
}

impl ClusterManagerBuilder {
    fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            helm: None,
            packager: None,
            store: None,
            deployer: None,
            pod_source: None,
        }
    }

    /// helm runner shared by the default packager and deployer
    pub fn helm(mut self, helm: Arc<dyn HelmRunner>) -> Self {
        self.helm = Some(helm);
        self
    }

    /// Override the bundle packager
    pub fn packager(mut self, packager: Arc<dyn BundlePackager>) -> Self {
        self.packager = Some(packager);
        self
    }

    /// Set the artifact store
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the release deployer
    pub fn deployer(mut self, deployer: Arc<dyn ReleaseDeployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Override the pod source used for status and listing
    pub fn pod_source(mut self, pod_source: Arc<dyn PodSource>) -> Self {
        self.pod_source = Some(pod_source);
        self
    }

    /// Validate configuration and assemble the manager
    pub fn build(self) -> Result<ClusterManager> {
        self.config.validate()?;
        let store = self.store.ok_or_else(|| {
            Error::internal_with_context("config", "no artifact store configured")
        })?;

        let config = self.config;
        let helm = self.helm.unwrap_or_else(|| {
            Arc::new(HelmCli::new(config.helm_binary.clone(), config.helm_timeout))
        });
        let packager = self
            .packager
            .unwrap_or_else(|| Arc::new(HelmPackager::new(helm.clone())));
        let deployer = self.deployer.unwrap_or_else(|| {
            Arc::new(DeploymentController::new(
                helm.clone(),
                config.retry.clone(),
                config.restart_annotation.clone(),
            ))
        });
        let pod_source = self
            .pod_source
            .unwrap_or_else(|| Arc::new(KubePodSource));

        Ok(ClusterManager {
            inspector: ResourceInspector::new(pod_source, config.release_label.clone()),
            contexts: KubeContextResolver::new(config.kubeconfig_dir.clone()),
            config: Arc::new(config),
            packager,
            store,
            deployer,
            locks: ReleaseLocks::new(),
        })
    }
}
