//! Resource inspection
//!
//! Reads live pods for a release and reduces them to a status summary, and
//! lists the releases present in a namespace. Pod listing goes through the
//! [`PodSource`] trait; [`KubePodSource`] is the kube-rs implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::kube_context::create_client;
use crate::model::{ClusterHealth, ClusterStatusSummary, PodCondition, ReleaseListingEntry};
use crate::{Error, Result};

/// The parts of a pod the inspector needs
#[derive(Clone, Debug, PartialEq)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
    /// Simplified condition
    pub condition: PodCondition,
}

/// Trait for listing pods in a target cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodSource: Send + Sync {
    /// List pods in `namespace` matching a label `selector`
    async fn list_pods(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodInfo>>;
}

/// Map a pod's reported status to a simplified condition
pub fn pod_condition(pod: &Pod) -> PodCondition {
    let Some(status) = pod.status.as_ref() else {
        return PodCondition::Unknown;
    };
    let ready = status
        .conditions
        .as_ref()
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True");

    match status.phase.as_deref() {
        Some("Running") => match ready {
            Some(true) => PodCondition::Ready,
            Some(false) => PodCondition::NotReady,
            None => PodCondition::Unknown,
        },
        Some("Pending") | Some("Failed") | Some("Succeeded") => PodCondition::NotReady,
        _ => PodCondition::Unknown,
    }
}

/// Pod source backed by kube-rs, one client per call
#[derive(Clone, Debug, Default)]
pub struct KubePodSource;

#[async_trait]
impl PodSource for KubePodSource {
    async fn list_pods(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodInfo>> {
        let client = create_client(kubeconfig).await?;
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;

        Ok(list
            .items
            .iter()
            .map(|pod| PodInfo {
                name: pod.name_any(),
                labels: pod.labels().clone(),
                condition: pod_condition(pod),
            })
            .collect())
    }
}

/// Resource inspector
pub struct ResourceInspector {
    pods: Arc<dyn PodSource>,
    release_label: String,
}

impl ResourceInspector {
    /// Create an inspector; `release_label` is the label carrying the release
    /// name on every pod of a release
    pub fn new(pods: Arc<dyn PodSource>, release_label: impl Into<String>) -> Self {
        Self {
            pods,
            release_label: release_label.into(),
        }
    }

    /// Summarise the pods of `release`
    ///
    /// Fails with `NotFound` when the release has no pods.
    pub async fn get_status(
        &self,
        kubeconfig: &Path,
        release: &str,
        namespace: &str,
    ) -> Result<ClusterStatusSummary> {
        let selector = format!("{}={}", self.release_label, release);
        let pods = self.pods.list_pods(kubeconfig, namespace, &selector).await?;
        if pods.is_empty() {
            return Err(Error::not_found(format!(
                "no resources for release {} in namespace {}",
                release, namespace
            )));
        }

        let pods: BTreeMap<String, PodCondition> =
            pods.into_iter().map(|p| (p.name, p.condition)).collect();
        let status = ClusterHealth::aggregate(pods.values());
        debug!(release, namespace, ?status, pods = pods.len(), "Release status computed");
        Ok(ClusterStatusSummary { status, pods })
    }

    /// List releases in `namespace` whose pods match `selector`
    ///
    /// Returns one entry per distinct value of `release_label`, represented by
    /// one of its pods. Pods without the label are skipped. Order is not
    /// significant.
    pub async fn list_releases(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        selector: &str,
        release_label: &str,
        request_id: &str,
    ) -> Result<Vec<ReleaseListingEntry>> {
        debug!(
            request_id,
            namespace,
            selector,
            release_label,
            kubeconfig = %kubeconfig.display(),
            "Listing releases"
        );
        let pods = self.pods.list_pods(kubeconfig, namespace, selector).await?;

        let mut releases: BTreeMap<String, String> = BTreeMap::new();
        for pod in pods {
            if let Some(release) = pod.labels.get(release_label) {
                releases.entry(release.clone()).or_insert(pod.name);
            }
        }

        Ok(releases
            .into_iter()
            .map(|(release_name, pod_name)| ReleaseListingEntry {
                release_name,
                pod_name,
            })
            .collect())
    }
}
