//! HTTP surface
//!
//! Routes:
//! - `POST /v2/cluster` - Package and upload a bundle (multipart)
//! - `PUT /v2/cluster` - Re-package and re-upload a bundle (multipart)
//! - `POST /v2/cluster/start` - Deploy a bundle as a release
//! - `POST /v2/cluster/stop` - Delete a release
//! - `POST /v2/cluster/restart` - Restart a release from a bundle
//! - `POST /v2/cluster/status` - Pod status of a release
//! - `GET /v2/cluster` - Releases in a namespace
//! - `GET /healthz` - Liveness

mod error;
mod handlers;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::manager::ClusterManager;

pub use error::ApiError;
pub use handlers::{ClusterResponse, DeployResponse};

/// Header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared handler state
pub struct AppState {
    manager: Arc<ClusterManager>,
    shutdown: CancellationToken,
}

impl AppState {
    /// State whose request tokens are children of `shutdown`
    pub fn new(manager: Arc<ClusterManager>, shutdown: CancellationToken) -> Self {
        Self { manager, shutdown }
    }
}

/// Request id of the current request
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Take the request id from the header or generate one, and echo it back
async fn propagate_request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Create the cluster manager router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v2/cluster",
            post(handlers::create_cluster)
                .put(handlers::update_cluster)
                .get(handlers::list_clusters),
        )
        .route("/v2/cluster/start", post(handlers::start_cluster))
        .route("/v2/cluster/stop", post(handlers::stop_cluster))
        .route("/v2/cluster/restart", post(handlers::restart_cluster))
        .route("/v2/cluster/status", post(handlers::cluster_status))
        .route("/healthz", get(handlers::healthz))
        .layer(middleware::from_fn(propagate_request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
