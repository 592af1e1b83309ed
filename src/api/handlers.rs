//! Request handlers

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Form, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::ApiError;
use super::{AppState, RequestId};
use crate::manager::RequestContext;
use crate::model::{Cluster, ClusterStatusSummary, DeploymentTarget, ReleaseListingEntry};
use crate::{Error, Result};

/// Overlay file name used when the upload carries none
const DEFAULT_OVERLAY_NAME: &str = "values.yaml";

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body returned by create and update
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterResponse {
    /// Cluster name
    pub cluster_name: String,
    /// Artifact name
    pub artifact_name: String,
    /// Location of the uploaded bundle
    pub artifact_url: String,
}

/// Body returned by start and restart
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployResponse {
    /// Cluster name
    pub cluster_name: String,
    /// Namespace deployed into
    pub namespace: String,
    /// Target context id
    pub kube_cluster: String,
}

/// Form fields shared by start, stop, restart and status
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TargetForm {
    cluster_name: String,
    artifact_name: String,
    namespace: String,
    kube_cluster: String,
}

/// Query of the listing route
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    namespace: String,
    kube_cluster: String,
}

fn require<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::validation(
            field,
            format!("no {} specified", field.replace('_', " ")),
        ));
    }
    Ok(value)
}

impl TargetForm {
    fn target(&self) -> Result<DeploymentTarget> {
        DeploymentTarget::new(
            require("namespace", &self.namespace)?,
            require("kube_cluster", &self.kube_cluster)?,
        )
    }
}

fn request_context(state: &AppState, request_id: &RequestId) -> RequestContext {
    RequestContext::new(request_id.0.clone())
        .with_cancellation(state.shutdown.child_token())
        .with_timeout(state.manager.config().request_timeout)
}

/// Keep only the final path component of an uploaded file name, restricted
/// to characters safe in a local file name
fn overlay_basename(file_name: Option<&str>) -> String {
    let base = file_name
        .and_then(|n| FsPath::new(n).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_OVERLAY_NAME);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        DEFAULT_OVERLAY_NAME.to_string()
    } else {
        cleaned
    }
}

fn bad_upload(e: axum::extract::multipart::MultipartError) -> Error {
    Error::validation("file", format!("malformed upload: {}", e))
}

/// Read the multipart form and stage the overlay under the values directory
async fn stage_upload(state: &AppState, mut multipart: Multipart) -> Result<Cluster> {
    let mut cluster_name = String::new();
    let mut artifact_name = String::new();
    let mut file = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_upload)? {
        match field.name().map(str::to_owned).as_deref() {
            Some("cluster_name") => cluster_name = field.text().await.map_err(bad_upload)?,
            Some("artifact_name") => artifact_name = field.text().await.map_err(bad_upload)?,
            Some("file") => {
                let name = overlay_basename(field.file_name());
                let data = field.bytes().await.map_err(bad_upload)?;
                file = Some((name, data));
            }
            other => debug!(field = ?other, "Ignoring unknown upload field"),
        }
    }

    let cluster_name = require("cluster_name", &cluster_name)?.to_string();
    let artifact_name = require("artifact_name", &artifact_name)?.to_string();
    let (base, data) = file.ok_or_else(|| Error::validation("file", "no file uploaded"))?;

    // name checks before anything touches the disk
    Cluster::new(&cluster_name, &artifact_name, "").validate()?;

    let values_dir = &state.manager.config().values_dir;
    tokio::fs::create_dir_all(values_dir)
        .await
        .map_err(|e| Error::internal_with_context("save overlay", e.to_string()))?;
    let token = uuid::Uuid::new_v4().simple().to_string();
    let overlay = values_dir.join(format!("{}-{}-{}", cluster_name, token, base));
    tokio::fs::write(&overlay, &data)
        .await
        .map_err(|e| Error::internal_with_context("save overlay", e.to_string()))?;
    debug!(path = %overlay.display(), bytes = data.len(), "Overlay staged");

    Ok(Cluster::new(cluster_name, artifact_name, overlay))
}

fn cluster_response(cluster: Cluster) -> Result<ClusterResponse> {
    let artifact_url = cluster
        .artifact_url
        .ok_or_else(|| Error::internal("published cluster has no artifact url"))?;
    Ok(ClusterResponse {
        cluster_name: cluster.name,
        artifact_name: cluster.artifact_name,
        artifact_url,
    })
}

/// `POST /v2/cluster`
pub async fn create_cluster(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<ClusterResponse>)> {
    let cluster = stage_upload(&state, multipart).await?;
    let ctx = request_context(&state, &request_id);
    let cluster = state.manager.create(&ctx, cluster).await?;
    Ok((StatusCode::CREATED, Json(cluster_response(cluster)?)))
}

/// `PUT /v2/cluster`
pub async fn update_cluster(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<ClusterResponse>)> {
    let cluster = stage_upload(&state, multipart).await?;
    let ctx = request_context(&state, &request_id);
    let cluster = state.manager.update(&ctx, cluster).await?;
    Ok((StatusCode::CREATED, Json(cluster_response(cluster)?)))
}

/// `POST /v2/cluster/start`
pub async fn start_cluster(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Form(form): Form<TargetForm>,
) -> ApiResult<(StatusCode, Json<DeployResponse>)> {
    let name = require("cluster_name", &form.cluster_name)?;
    let artifact = require("artifact_name", &form.artifact_name)?;
    let target = form.target()?;
    let ctx = request_context(&state, &request_id);

    state.manager.start(&ctx, name, artifact, &target).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            cluster_name: name.to_string(),
            namespace: target.namespace,
            kube_cluster: target.context,
        }),
    ))
}

/// `POST /v2/cluster/restart`
pub async fn restart_cluster(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Form(form): Form<TargetForm>,
) -> ApiResult<(StatusCode, Json<DeployResponse>)> {
    let name = require("cluster_name", &form.cluster_name)?;
    let artifact = require("artifact_name", &form.artifact_name)?;
    let target = form.target()?;
    let ctx = request_context(&state, &request_id);

    let release = state.manager.restart(&ctx, name, artifact, &target).await?;
    info!(request_id = %request_id.0, release = %release.name, "Restart accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            cluster_name: name.to_string(),
            namespace: target.namespace,
            kube_cluster: target.context,
        }),
    ))
}

/// `POST /v2/cluster/stop`
pub async fn stop_cluster(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Form(form): Form<TargetForm>,
) -> ApiResult<(StatusCode, Json<&'static str>)> {
    let name = require("cluster_name", &form.cluster_name)?;
    let target = form.target()?;
    let ctx = request_context(&state, &request_id);

    state.manager.stop(&ctx, name, &target).await?;
    Ok((StatusCode::ACCEPTED, Json("cluster stopped")))
}

/// `POST /v2/cluster/status`
pub async fn cluster_status(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Form(form): Form<TargetForm>,
) -> ApiResult<Json<ClusterStatusSummary>> {
    let name = require("cluster_name", &form.cluster_name)?;
    let target = form.target()?;
    let ctx = request_context(&state, &request_id);

    Ok(Json(state.manager.status(&ctx, name, &target).await?))
}

/// `GET /v2/cluster`
pub async fn list_clusters(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ReleaseListingEntry>>> {
    let ctx = request_context(&state, &request_id);
    let entries = state
        .manager
        .list(&ctx, query.namespace.trim(), query.kube_cluster.trim())
        .await?;
    Ok(Json(entries))
}

/// `GET /healthz`
pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_basename_strips_directories() {
        assert_eq!(overlay_basename(Some("../../etc/passwd")), "passwd");
        assert_eq!(overlay_basename(Some("/abs/values.yaml")), "values.yaml");
        assert_eq!(overlay_basename(Some("my values.yaml")), "my_values.yaml");
        assert_eq!(overlay_basename(Some("..")), "values.yaml");
        assert_eq!(overlay_basename(None), "values.yaml");
    }

    #[test]
    fn empty_fields_are_reported_by_name() {
        let err = require("kube_cluster", "  ").unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "kube_cluster"));
        assert!(err.to_string().contains("no kube cluster specified"));
    }
}
