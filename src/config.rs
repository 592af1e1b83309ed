//! Cluster manager configuration
//!
//! Paths, store prefix, selectors and timeouts are gathered into one
//! [`ManagerConfig`] built once at startup (see `main.rs` for the clap/env
//! wiring) and shared by every collaborator.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Default bundle template (helm chart directory)
pub const DEFAULT_CHART_PATH: &str = "./charts/ray-cluster";
/// Fixed prefix for every artifact store key
pub const DEFAULT_ARTIFACT_PREFIX: &str = "mlp/cluster_manager/";
/// Local staging root for packaged bundles
pub const DEFAULT_ARTIFACTS_DIR: &str = "./tmp/artifacts/";
/// Local staging root for uploaded overlays
pub const DEFAULT_VALUES_DIR: &str = "./tmp/values/";
/// Directory holding one kubeconfig per target context
pub const DEFAULT_KUBECONFIG_DIR: &str = "./configs/";
/// Selects the head pod of each cluster
pub const DEFAULT_HEAD_SELECTOR: &str = "ray.io/is-ray-node=yes, ray.io/node-type=head";
/// Label carrying the helm release name on every pod
pub const DEFAULT_RELEASE_LABEL: &str = "app.kubernetes.io/instance";
/// Values path set to a timestamp to force a rollout on restart
pub const DEFAULT_RESTART_ANNOTATION: &str = "podAnnotations.restartedAt";
/// Label key used for environment scoping of listings
pub const ENVIRONMENT_LABEL: &str = "environment_name";

/// Runtime configuration shared by all lifecycle components
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Bundle template directory
    pub chart_path: PathBuf,
    /// Store key prefix; keys are `artifact_prefix + artifact_name`
    pub artifact_prefix: String,
    /// Local staging root for packaged bundles
    pub artifacts_dir: PathBuf,
    /// Local staging root for uploaded overlays
    pub values_dir: PathBuf,
    /// Directory of per-context kubeconfig files
    pub kubeconfig_dir: PathBuf,
    /// Deployment environment appended to listing selectors
    pub environment: Option<String>,
    /// Base selector for listing cluster head pods
    pub head_selector: String,
    /// Label whose value is the release name
    pub release_label: String,
    /// Values path bumped by restart
    pub restart_annotation: String,
    /// helm executable
    pub helm_binary: PathBuf,
    /// Timeout for a single helm invocation
    pub helm_timeout: Duration,
    /// Deadline applied to each inbound request
    pub request_timeout: Duration,
    /// Retry policy for install/upgrade
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            chart_path: PathBuf::from(DEFAULT_CHART_PATH),
            artifact_prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
            values_dir: PathBuf::from(DEFAULT_VALUES_DIR),
            kubeconfig_dir: PathBuf::from(DEFAULT_KUBECONFIG_DIR),
            environment: None,
            head_selector: DEFAULT_HEAD_SELECTOR.to_string(),
            release_label: DEFAULT_RELEASE_LABEL.to_string(),
            restart_annotation: DEFAULT_RESTART_ANNOTATION.to_string(),
            helm_binary: PathBuf::from("helm"),
            helm_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(900),
            retry: RetryPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Store key for an artifact name
    pub fn store_key(&self, artifact_name: &str) -> String {
        format!("{}{}", self.artifact_prefix, artifact_name)
    }

    /// Selector used to list releases: head selector plus environment scope
    pub fn listing_selector(&self) -> String {
        match self.environment.as_deref().filter(|e| !e.is_empty()) {
            Some(env) => format!("{}, {}={}", self.head_selector, ENVIRONMENT_LABEL, env),
            None => self.head_selector.clone(),
        }
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.artifact_prefix.is_empty() {
            return Err(Error::internal_with_context(
                "config",
                "artifact prefix must not be empty",
            ));
        }
        if self.head_selector.trim().is_empty() || self.release_label.trim().is_empty() {
            return Err(Error::internal_with_context(
                "config",
                "head selector and release label must not be empty",
            ));
        }
        if self.restart_annotation.trim().is_empty() {
            return Err(Error::internal_with_context(
                "config",
                "restart annotation must not be empty",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::internal_with_context(
                "config",
                "retry policy needs at least one attempt",
            ));
        }
        if self.retry.max_total_delay() >= self.request_timeout {
            return Err(Error::internal_with_context(
                "config",
                format!(
                    "retry backoff of up to {:?} does not fit the {:?} request timeout",
                    self.retry.max_total_delay(),
                    self.request_timeout
                ),
            ));
        }
        for (name, path) in [
            ("chart path", &self.chart_path),
            ("artifacts dir", &self.artifacts_dir),
            ("values dir", &self.values_dir),
            ("kubeconfig dir", &self.kubeconfig_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(Error::internal_with_context(
                    "config",
                    format!("{} must not be empty", name),
                ));
            }
        }
        Ok(())
    }
}
