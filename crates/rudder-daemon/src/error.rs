//! Daemon-specific error types

use thiserror::Error;

use crate::cluster::ClusterError;

/// Errors specific to controller operations
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Failed to bind the HTTP listener
    #[error("Failed to bind to socket: {0}")]
    BindFailed(String),

    /// Failed to acquire the controller lock
    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),

    /// No worker for the named application
    #[error("Unknown application: {0}")]
    ApplicationNotFound(String),

    /// Destination server missing from the cluster pool
    #[error("Unknown cluster: {0}")]
    ClusterNotFound(String),

    /// Core rudder error (config, render, store)
    #[error("Core error: {0}")]
    Core(#[from] librudder_core::CoreError),

    /// Git error
    #[error("Git error: {0}")]
    Git(#[from] librudder_git::GitError),

    /// Cluster API error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel send error
    #[error("Channel error: {0}")]
    Channel(String),
}

impl DaemonError {
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::BindFailed(_) => "bind_failed",
            DaemonError::LockFailed(_) => "lock_failed",
            DaemonError::ApplicationNotFound(_) => "application_not_found",
            DaemonError::ClusterNotFound(_) => "cluster_not_found",
            DaemonError::Core(e) => e.error_code(),
            DaemonError::Git(e) => e.error_code(),
            DaemonError::Cluster(e) => e.error_code(),
            DaemonError::Io(_) => "io_error",
            DaemonError::Json(_) => "json_error",
            DaemonError::Channel(_) => "channel_error",
        }
    }
}
