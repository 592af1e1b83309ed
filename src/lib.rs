//! Cluster Manager - lifecycle orchestration for distributed compute clusters
//! on Kubernetes
//!
//! A cluster is a templated helm chart (head plus workers) customised by a
//! caller-supplied values overlay. The manager packages the chart and overlay
//! into a bundle, stores the bundle under a content key, and deploys, stops,
//! restarts and inspects releases of it in a chosen namespace of a chosen
//! target cluster.
//!
//! # Modules
//!
//! - [`manager`] - Lifecycle orchestrator and request context
//! - [`packager`] - Bundle packaging from chart template and overlay
//! - [`store`] - Artifact store (filesystem and HTTP backends)
//! - [`deploy`] - helm-backed deployment controller with retries
//! - [`inspect`] - Pod status and release listing via kube-rs
//! - [`api`] - HTTP surface
//! - [`config`] - Manager configuration and defaults
//! - [`error`] - Error types and status classification

#![deny(missing_docs)]

pub mod api;
pub mod config;
pub mod deploy;
pub mod error;
pub mod helm;
pub mod inspect;
pub mod kube_context;
pub mod lock;
pub mod manager;
pub mod model;
pub mod packager;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod yaml;

pub use error::{Error, ErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default listen address for the HTTP server
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
