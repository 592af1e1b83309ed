//! Cluster Manager - HTTP service for cluster lifecycle on Kubernetes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use cluster_manager::api::{self, AppState};
use cluster_manager::config::{
    ManagerConfig, DEFAULT_ARTIFACTS_DIR, DEFAULT_ARTIFACT_PREFIX, DEFAULT_CHART_PATH,
    DEFAULT_HEAD_SELECTOR, DEFAULT_KUBECONFIG_DIR, DEFAULT_RELEASE_LABEL,
    DEFAULT_RESTART_ANNOTATION, DEFAULT_VALUES_DIR,
};
use cluster_manager::manager::ClusterManager;
use cluster_manager::retry::{Backoff, RetryPolicy};
use cluster_manager::store::{ArtifactStore, FsArtifactStore, HttpArtifactStore};
use cluster_manager::telemetry::{self, LogFormat};
use cluster_manager::DEFAULT_LISTEN_ADDR;

/// Cluster Manager - package, deploy and inspect compute clusters on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "cluster-manager", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API
    Serve(ServeArgs),
}

/// Server arguments
#[derive(Args, Debug)]
#[command(group(
    clap::ArgGroup::new("store")
        .required(true)
        .args(["store_root", "store_url"]),
))]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    listen: SocketAddr,

    /// Chart template directory
    #[arg(long, env = "CHART_PATH", default_value = DEFAULT_CHART_PATH)]
    chart_path: PathBuf,

    /// Prefix prepended to artifact names to form store keys
    #[arg(long, env = "ARTIFACT_PREFIX", default_value = DEFAULT_ARTIFACT_PREFIX)]
    artifact_prefix: String,

    /// Directory for packaged and downloaded bundles
    #[arg(long, env = "ARTIFACTS_DIR", default_value = DEFAULT_ARTIFACTS_DIR)]
    artifacts_dir: PathBuf,

    /// Directory for uploaded overlays
    #[arg(long, env = "VALUES_DIR", default_value = DEFAULT_VALUES_DIR)]
    values_dir: PathBuf,

    /// Directory holding one kubeconfig per target context
    #[arg(long, env = "KUBECONFIG_DIR", default_value = DEFAULT_KUBECONFIG_DIR)]
    kubeconfig_dir: PathBuf,

    /// Deployment environment; scopes release listing
    #[arg(long, env = "ENV")]
    environment: Option<String>,

    /// Label selector for head pods
    #[arg(long, env = "HEAD_SELECTOR", default_value = DEFAULT_HEAD_SELECTOR)]
    head_selector: String,

    /// Label carrying the release name on every pod
    #[arg(long, env = "RELEASE_LABEL", default_value = DEFAULT_RELEASE_LABEL)]
    release_label: String,

    /// Values key set to a timestamp on restart
    #[arg(long, env = "RESTART_ANNOTATION", default_value = DEFAULT_RESTART_ANNOTATION)]
    restart_annotation: String,

    /// helm executable
    #[arg(long, env = "HELM_BINARY", default_value = "helm")]
    helm_binary: PathBuf,

    /// Timeout for one helm invocation in seconds
    #[arg(long, env = "HELM_TIMEOUT_SECS", default_value = "300")]
    helm_timeout_secs: u64,

    /// Deadline for one request in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "900")]
    request_timeout_secs: u64,

    /// Attempt ceiling for install or upgrade
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value = "3")]
    retry_max_attempts: u32,

    /// First retry delay in seconds, doubling up to 30s
    #[arg(long, env = "RETRY_INITIAL_DELAY_SECS", default_value = "2")]
    retry_initial_delay_secs: u64,

    /// Filesystem artifact store root
    #[arg(long, env = "STORE_ROOT")]
    store_root: Option<PathBuf>,

    /// HTTP artifact store base URL
    #[arg(long, env = "STORE_URL")]
    store_url: Option<String>,

    /// Bearer token for the HTTP artifact store
    #[arg(long, env = "STORE_TOKEN", hide_env_values = true)]
    store_token: Option<String>,
}

impl ServeArgs {
    fn manager_config(&self) -> ManagerConfig {
        let defaults = RetryPolicy::default();
        ManagerConfig {
            chart_path: self.chart_path.clone(),
            artifact_prefix: self.artifact_prefix.clone(),
            artifacts_dir: self.artifacts_dir.clone(),
            values_dir: self.values_dir.clone(),
            kubeconfig_dir: self.kubeconfig_dir.clone(),
            environment: self.environment.clone(),
            head_selector: self.head_selector.clone(),
            release_label: self.release_label.clone(),
            restart_annotation: self.restart_annotation.clone(),
            helm_binary: self.helm_binary.clone(),
            helm_timeout: Duration::from_secs(self.helm_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                backoff: Backoff::Exponential {
                    initial: Duration::from_secs(self.retry_initial_delay_secs),
                    max: Duration::from_secs(30),
                    multiplier: 2.0,
                },
                ..defaults
            },
        }
    }

    fn artifact_store(&self) -> anyhow::Result<Arc<dyn ArtifactStore>> {
        match (&self.store_root, &self.store_url) {
            (Some(root), None) => Ok(Arc::new(FsArtifactStore::new(root.clone()))),
            (None, Some(url)) => Ok(Arc::new(HttpArtifactStore::new(
                url.clone(),
                self.store_token.clone(),
            ))),
            _ => Err(anyhow::anyhow!(
                "exactly one of --store-root or --store-url is required"
            )),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Serve(args) => run_server(args).await,
    }
}

/// Run the HTTP server until ctrl-c
async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.manager_config();
    let store = args.artifact_store()?;

    store
        .configure()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to configure artifact store: {}", e))?;

    let manager = ClusterManager::builder(config)
        .store(store)
        .build()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(Arc::new(manager), shutdown.clone()));
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", args.listen, e))?;
    info!(addr = %args.listen, "Cluster manager listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested, cancelling in-flight requests");
            signal.cancel();
        })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("Cluster manager stopped");
    Ok(())
}
