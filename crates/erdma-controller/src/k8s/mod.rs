//! Kubernetes integration.
//!
//! - [`node_watcher::NodeWatcher`]: creates and removes `ERdmaDevice` objects
//!   as nodes come and go
//! - [`device_reconciler`]: drives every `ERdmaDevice` towards `Ready`

use core::error::Error;

pub mod device_object;
pub mod device_reconciler;
pub mod kube_client;
pub mod node;
pub mod node_watcher;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch {resource}: {message}")]
    WatchFailed { resource: String, message: String },
    #[display("Kubernetes API call failed: {message}")]
    ApiCall { message: String },
    #[display("Failed to resolve ERIs for node {node}")]
    Resolve { node: String },
    #[display("Timed out waiting for {what}")]
    Timeout { what: String },
}

impl Error for KubernetesError {}
