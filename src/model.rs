//! Cluster, target and artifact types shared across the lifecycle pipeline

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Longest release name helm accepts
pub const MAX_RELEASE_NAME_LEN: usize = 53;
/// Longest namespace name (DNS-1123 label)
pub const MAX_NAMESPACE_LEN: usize = 63;
/// Longest artifact name
pub const MAX_ARTIFACT_NAME_LEN: usize = 253;

/// Identity and deployment descriptor for one managed cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique human identifier, also the helm release name
    pub name: String,
    /// Logical name of the packaged bundle (versioned by the caller)
    pub artifact_name: String,
    /// Local overlay file, only meaningful during create/update
    #[serde(skip)]
    pub overlay_path: PathBuf,
    /// Store locator, set only after a successful upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
}

impl Cluster {
    /// Describe a cluster whose overlay has been staged locally
    pub fn new(
        name: impl Into<String>,
        artifact_name: impl Into<String>,
        overlay_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact_name: artifact_name.into(),
            overlay_path: overlay_path.into(),
            artifact_url: None,
        }
    }

    /// Check the name and artifact name before any side effect
    pub fn validate(&self) -> Result<()> {
        validate_release_name(&self.name)?;
        validate_artifact_name(&self.artifact_name)
    }
}

/// Where an operation executes
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// Kubernetes namespace
    pub namespace: String,
    /// Name of the kubeconfig under the configured directory
    pub context: String,
}

impl DeploymentTarget {
    /// Build a target, validating both parts
    pub fn new(namespace: impl Into<String>, context: impl Into<String>) -> Result<Self> {
        let target = Self {
            namespace: namespace.into(),
            context: context.into(),
        };
        validate_namespace(&target.namespace)?;
        validate_context_id(&target.context)?;
        Ok(target)
    }
}

/// An immutable packaged bundle on local disk
#[derive(Clone, Debug, PartialEq)]
pub struct BundleArtifact {
    /// Ephemeral location owned by the current operation
    pub local_path: PathBuf,
    /// Deterministic remote key
    pub store_key: String,
}

impl BundleArtifact {
    /// Pair a local file with its store key
    pub fn new(local_path: impl Into<PathBuf>, store_key: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            store_key: store_key.into(),
        }
    }

    /// Local path of the bundle file
    pub fn path(&self) -> &Path {
        &self.local_path
    }
}

/// Simplified condition of one pod
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PodCondition {
    /// Running with the Ready condition true
    Ready,
    /// Present but not (yet) serving
    NotReady,
    /// No usable status reported
    Unknown,
}

/// Aggregate condition of a release
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ClusterHealth {
    /// Every pod is ready
    Ready,
    /// At least one pod is not ready
    NotReady,
    /// No pod is failing, but at least one reports nothing usable
    Unknown,
}

impl ClusterHealth {
    /// Reduce per-pod conditions to one value
    ///
    /// Returns `Unknown` for an empty input.
    pub fn aggregate<'a>(conditions: impl IntoIterator<Item = &'a PodCondition>) -> Self {
        let mut saw_any = false;
        let mut saw_unknown = false;
        for condition in conditions {
            saw_any = true;
            match condition {
                PodCondition::NotReady => return ClusterHealth::NotReady,
                PodCondition::Unknown => saw_unknown = true,
                PodCondition::Ready => {}
            }
        }
        if !saw_any || saw_unknown {
            ClusterHealth::Unknown
        } else {
            ClusterHealth::Ready
        }
    }
}

/// Status of a release, recomputed on every query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatusSummary {
    /// Aggregate condition
    pub status: ClusterHealth,
    /// Condition per pod name
    pub pods: BTreeMap<String, PodCondition>,
}

/// One entry of a release listing
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseListingEntry {
    /// Value of the release label
    pub release_name: String,
    /// A pod representing the release
    pub pod_name: String,
}

/// Helm release name rule: lowercase alphanumerics and '-', alphanumeric at
/// both ends, at most 53 characters.
pub fn validate_release_name(name: &str) -> Result<()> {
    validate_dns_label("cluster_name", name, MAX_RELEASE_NAME_LEN)
}

/// DNS-1123 label, at most 63 characters
pub fn validate_namespace(namespace: &str) -> Result<()> {
    validate_dns_label("namespace", namespace, MAX_NAMESPACE_LEN)
}

/// Artifact names end up in store keys and local file names
pub fn validate_artifact_name(name: &str) -> Result<()> {
    validate_file_component("artifact_name", name, MAX_ARTIFACT_NAME_LEN)
}

/// Context ids name a file under the kubeconfig directory
pub fn validate_context_id(id: &str) -> Result<()> {
    validate_file_component("kube_cluster", id, MAX_ARTIFACT_NAME_LEN)
}

fn validate_dns_label(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    if value.len() > max_len {
        return Err(Error::validation(
            field,
            format!("'{}' is longer than {} characters", value, max_len),
        ));
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let bytes = value.as_bytes();
    let valid_ends =
        bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    if !valid_chars || !valid_ends {
        return Err(Error::validation(
            field,
            format!(
                "'{}' must consist of lowercase alphanumerics or '-' and start and end with an alphanumeric",
                value
            ),
        ));
    }
    Ok(())
}

fn validate_file_component(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    if value.len() > max_len {
        return Err(Error::validation(
            field,
            format!("'{}' is longer than {} characters", value, max_len),
        ));
    }
    if value == "." || value == ".." {
        return Err(Error::validation(field, format!("'{}' is not allowed", value)));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(Error::validation(
            field,
            format!("'{}' may only contain alphanumerics, '.', '_' or '-'", value),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn release_names_follow_helm_rules() {
        assert!(validate_release_name("ml-job-1").is_ok());
        assert!(validate_release_name("a").is_ok());

        for bad in ["", "ML-Job", "-job", "job-", "job_1", "job.1", "a/b"] {
            let err = validate_release_name(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad:?} should be rejected");
        }

        let long = "a".repeat(MAX_RELEASE_NAME_LEN + 1);
        assert!(validate_release_name(&long).is_err());
        assert!(validate_release_name(&"a".repeat(MAX_RELEASE_NAME_LEN)).is_ok());
    }

    #[test]
    fn artifact_names_cannot_escape_their_directory() {
        assert!(validate_artifact_name("bundle-v3").is_ok());
        assert!(validate_artifact_name("bundle_v3.1").is_ok());
        for bad in ["", ".", "..", "../etc", "a/b", "a b"] {
            assert!(validate_artifact_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn targets_validate_namespace_and_context() {
        let target = DeploymentTarget::new("ns-a", "ctx-1").unwrap();
        assert_eq!(target.namespace, "ns-a");
        assert_eq!(target.context, "ctx-1");

        assert!(DeploymentTarget::new("", "ctx-1").is_err());
        assert!(DeploymentTarget::new("ns-a", "").is_err());
        assert!(DeploymentTarget::new("ns-a", "../admin").is_err());
    }

    #[test]
    fn cluster_validation_checks_both_names() {
        assert!(Cluster::new("ml-job-1", "bundle-v3", "/tmp/o.yaml")
            .validate()
            .is_ok());
        assert!(Cluster::new("", "bundle-v3", "/tmp/o.yaml").validate().is_err());
        assert!(Cluster::new("ml-job-1", "", "/tmp/o.yaml").validate().is_err());
    }

    // ==========================================================================
    // Story: status aggregation
    // ==========================================================================

    #[test]
    fn story_all_ready_pods_make_a_ready_cluster() {
        let conditions = [PodCondition::Ready, PodCondition::Ready];
        assert_eq!(ClusterHealth::aggregate(&conditions), ClusterHealth::Ready);
    }

    #[test]
    fn story_one_failing_pod_makes_the_cluster_not_ready() {
        let conditions = [PodCondition::Ready, PodCondition::Unknown, PodCondition::NotReady];
        assert_eq!(ClusterHealth::aggregate(&conditions), ClusterHealth::NotReady);
    }

    #[test]
    fn story_unknown_pods_make_the_cluster_unknown() {
        let conditions = [PodCondition::Ready, PodCondition::Unknown];
        assert_eq!(ClusterHealth::aggregate(&conditions), ClusterHealth::Unknown);
        assert_eq!(ClusterHealth::aggregate(&[]), ClusterHealth::Unknown);
    }
}
