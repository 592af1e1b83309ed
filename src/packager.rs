//! Bundle packaging
//!
//! A bundle is the cluster chart with the caller's overlay merged into its
//! `values.yaml`, packaged by `helm package` into a single archive. Packaging
//! happens in a scratch directory next to the output so the output file
//! appears atomically or not at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::helm::HelmRunner;
use crate::yaml::{merge_values, parse_values, to_yaml};
use crate::{Error, Result};

const CHART_FILE: &str = "Chart.yaml";
const VALUES_FILE: &str = "values.yaml";

/// Trait for producing deployment bundles
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundlePackager: Send + Sync {
    /// Merge `overlay` over the template at `template` and write exactly one
    /// bundle file to `output`
    ///
    /// Inputs are never modified. On failure nothing is left at `output`.
    async fn package(&self, template: &Path, overlay: &Path, output: &Path) -> Result<PathBuf>;
}

/// Packager backed by `helm package`
pub struct HelmPackager {
    helm: Arc<dyn HelmRunner>,
}

impl HelmPackager {
    /// Create a packager that runs helm through `helm`
    pub fn new(helm: Arc<dyn HelmRunner>) -> Self {
        Self { helm }
    }
}

fn artifact_label(output: &Path) -> String {
    output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| output.display().to_string())
}

/// Read and parse the overlay, failing with a packaging error
async fn load_overlay(
    artifact: &str,
    overlay: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let raw = tokio::fs::read_to_string(overlay).await.map_err(|e| {
        Error::packaging(
            artifact,
            format!("cannot read overlay {}: {}", overlay.display(), e),
        )
    })?;
    parse_values(&raw).map_err(|e| {
        Error::packaging(
            artifact,
            format!("malformed overlay {}: {}", overlay.display(), e),
        )
    })
}

/// Read the chart's default values, checking it looks like a chart
async fn load_template_values(
    artifact: &str,
    template: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    if !tokio::fs::try_exists(template.join(CHART_FILE))
        .await
        .unwrap_or(false)
    {
        return Err(Error::packaging(
            artifact,
            format!("template {} has no {}", template.display(), CHART_FILE),
        ));
    }
    match tokio::fs::read_to_string(template.join(VALUES_FILE)).await {
        Ok(raw) => parse_values(&raw).map_err(|e| {
            Error::packaging(
                artifact,
                format!("malformed template values in {}: {}", template.display(), e),
            )
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Default::default()),
        Err(e) => Err(Error::packaging(
            artifact,
            format!("cannot read template values: {}", e),
        )),
    }
}

/// Copy a directory tree
async fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

/// The one archive helm wrote into `dir`
async fn find_archive(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tgz") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[async_trait]
impl BundlePackager for HelmPackager {
    async fn package(&self, template: &Path, overlay: &Path, output: &Path) -> Result<PathBuf> {
        let artifact = artifact_label(output);

        // Validate every input before touching the filesystem
        let overlay_values = load_overlay(&artifact, overlay).await?;
        let mut values = load_template_values(&artifact, template).await?;
        merge_values(&mut values, overlay_values);
        let rendered = to_yaml(&values)
            .map_err(|e| Error::packaging(&artifact, format!("cannot render values: {}", e)))?;

        let parent = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::packaging(
                &artifact,
                format!("cannot create {}: {}", parent.display(), e),
            )
        })?;

        // Dropped (and removed) on every exit path
        let scratch = tempfile::Builder::new()
            .prefix(".package-")
            .tempdir_in(parent)
            .map_err(|e| Error::packaging(&artifact, format!("cannot create scratch dir: {}", e)))?;
        let chart_dir = scratch.path().join("chart");
        let dest_dir = scratch.path().join("out");

        copy_tree(template, &chart_dir).await.map_err(|e| {
            Error::packaging(
                &artifact,
                format!("cannot copy template {}: {}", template.display(), e),
            )
        })?;
        tokio::fs::write(chart_dir.join(VALUES_FILE), rendered)
            .await
            .map_err(|e| Error::packaging(&artifact, format!("cannot write values: {}", e)))?;
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| Error::packaging(&artifact, e.to_string()))?;

        let args = vec![
            "package".to_string(),
            chart_dir.display().to_string(),
            "--destination".to_string(),
            dest_dir.display().to_string(),
        ];
        let out = self
            .helm
            .run(args)
            .await
            .map_err(|e| Error::packaging(&artifact, e.to_string()))?;
        if !out.success {
            return Err(Error::packaging(
                &artifact,
                format!("helm package failed: {}", out.stderr.trim()),
            ));
        }

        let archive = find_archive(&dest_dir)
            .await
            .map_err(|e| Error::packaging(&artifact, e.to_string()))?
            .ok_or_else(|| Error::packaging(&artifact, "helm package produced no archive"))?;
        debug!(archive = %archive.display(), "helm package produced archive");

        tokio::fs::rename(&archive, output).await.map_err(|e| {
            Error::packaging(
                &artifact,
                format!("cannot move bundle to {}: {}", output.display(), e),
            )
        })?;

        info!(artifact = %artifact, output = %output.display(), "Bundle packaged");
        Ok(output.to_path_buf())
    }
}
