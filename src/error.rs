//! Error types for cluster lifecycle operations
//!
//! Errors are structured with fields to aid debugging in production.
//! Every variant maps onto one [`ErrorKind`], which is the status
//! classification callers see.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Status classification surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing input
    Validation,
    /// Bundle could not be packaged from the template and overlay
    Packaging,
    /// Artifact store I/O failure
    Store,
    /// Kubernetes operation failed
    Deployment,
    /// Release or artifact absent
    NotFound,
    /// Caller cancelled the request
    Cancelled,
    /// Caller deadline elapsed
    Timeout,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this classification
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::Packaging => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Cancelled => 499,
            ErrorKind::Store | ErrorKind::Deployment => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }
}

/// Main error type for cluster manager operations
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing input
    #[error("validation error for {field}: {message}")]
    Validation {
        /// The offending input field (e.g. "cluster_name")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Bundle packaging failed (caller-input problem, never retried)
    #[error("packaging error for {artifact}: {message}")]
    Packaging {
        /// Artifact being packaged
        artifact: String,
        /// Description of what failed
        message: String,
    },

    /// Artifact store I/O failure
    #[error("store error [{key}]: {message}")]
    Store {
        /// Store key involved in the failed call
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Artifact key does not exist in the store
    #[error("artifact not found: {key}")]
    ArtifactNotFound {
        /// Store key that was requested
        key: String,
    },

    /// Deployment failed, either immediately or after exhausting retries
    #[error("deployment of {release} failed after {attempts} attempt(s): {message}")]
    Deployment {
        /// Release the operation targeted
        release: String,
        /// Number of attempts made
        attempts: u32,
        /// Last underlying failure
        message: String,
        /// Whether the last failure looked transient
        transient: bool,
    },

    /// Release has no live resources
    #[error("not found: {message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Request cancelled while a step was in flight
    #[error("cancelled during {step}")]
    Cancelled {
        /// Step that was interrupted
        step: String,
    },

    /// Request deadline elapsed while a step was in flight
    #[error("deadline exceeded during {step}")]
    Timeout {
        /// Step that was interrupted
        step: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "api", "config")
        context: String,
    },
}

impl Error {
    /// Create a validation error for an input field
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a packaging error for an artifact
    pub fn packaging(artifact: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Packaging {
            artifact: artifact.into(),
            message: msg.into(),
        }
    }

    /// Create a store error for a key
    pub fn store(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an artifact-not-found error
    pub fn artifact_not_found(key: impl Into<String>) -> Self {
        Self::ArtifactNotFound { key: key.into() }
    }

    /// Create a deployment error for a single helm attempt
    pub fn deployment(release: impl Into<String>, msg: impl Into<String>, transient: bool) -> Self {
        Self::Deployment {
            release: release.into(),
            attempts: 1,
            message: msg.into(),
            transient,
        }
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Status classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Packaging { .. } => ErrorKind::Packaging,
            Error::Store { .. } => ErrorKind::Store,
            Error::ArtifactNotFound { .. } | Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Deployment { .. } => ErrorKind::Deployment,
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 404 => ErrorKind::NotFound,
                _ => ErrorKind::Deployment,
            },
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is worth retrying
    ///
    /// Only Kubernetes-side failures may be transient. Input, packaging and
    /// store errors are returned to the caller as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Deployment { transient, .. } => *transient,
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            _ => false,
        }
    }
}
