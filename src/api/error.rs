//! HTTP mapping of lifecycle errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use crate::{Error, ErrorKind};

/// Lifecycle error rendered as a JSON failure body
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = StatusCode::from_u16(kind.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = match kind {
            // details stay in the log
            ErrorKind::Internal => {
                error!(error = %self.0, "Request failed");
                "internal error".to_string()
            }
            _ => {
                warn!(error = %self.0, kind = ?kind, "Request failed");
                self.0.to_string()
            }
        };

        let body = serde_json::json!({
            "status": status.as_u16(),
            "kind": kind,
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}
