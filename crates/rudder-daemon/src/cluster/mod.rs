//! Cluster API seam
//!
//! The controller talks to destination clusters only through [`ClusterApi`].
//! Every live resource is tracked under an owner (the application name);
//! writes are guarded by resource version tokens, never by locks.

mod directory;
mod memory;
mod pool;

pub use directory::DirectoryCluster;
pub use memory::{Fault, MemoryCluster};
pub use pool::{ClusterPool, RateLimitedClient};

use async_trait::async_trait;
use librudder_core::types::OperationError;
use librudder_core::{ResourceDescriptor, ResourceId};
use thiserror::Error;

/// Errors returned by a cluster backend
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Optimistic concurrency clash; retried after re-reading the version
    #[error("conflict on {id}: expected version {expected}, found {actual}")]
    Conflict { id: String, expected: String, actual: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("admission rejected {id}: {reason}")]
    AdmissionRejected { id: String, reason: String },

    #[error("invalid resource {id}: {reason}")]
    Invalid { id: String, reason: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// Conflicts, timeouts and unavailability are transient
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Conflict { .. } | ClusterError::Timeout(_) | ClusterError::Unavailable(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ClusterError::Conflict { .. } => "apply_conflict",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::AlreadyExists(_) => "already_exists",
            ClusterError::AdmissionRejected { .. } => "admission_rejected",
            ClusterError::Invalid { .. } => "invalid_spec",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::Unavailable(_) => "unavailable",
            ClusterError::Io(_) => "io_error",
            ClusterError::Json(_) => "json_error",
        }
    }

    /// Record form attached to a failed sync operation
    pub fn to_operation_error(&self) -> OperationError {
        OperationError {
            code: self.error_code().to_string(),
            message: self.to_string(),
            terminal: !self.is_retryable(),
        }
    }
}

/// Access to one destination cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Current live descriptor, with its resource version
    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, ClusterError>;

    /// Every live resource tracked under `owner`
    async fn list(&self, owner: &str) -> Result<Vec<ResourceDescriptor>, ClusterError>;

    /// Create a resource; returns its new version
    async fn create(&self, owner: &str, resource: &ResourceDescriptor) -> Result<String, ClusterError>;

    /// Replace a resource if its version still matches; returns the new version
    async fn update(
        &self,
        owner: &str,
        resource: &ResourceDescriptor,
        expected_version: Option<&str>,
    ) -> Result<String, ClusterError>;

    /// Delete a resource if its version still matches
    async fn delete(&self, id: &ResourceId, expected_version: Option<&str>) -> Result<(), ClusterError>;
}

/// Reject identities that cannot be used as storage keys.
///
/// Kind, namespace and name each become one path segment in file-backed
/// backends, so none may be empty, `.`, contain `..` or a path separator.
pub(crate) fn validate_id(id: &ResourceId) -> Result<(), ClusterError> {
    let check = |field: &str, value: &str| -> Result<(), ClusterError> {
        if value.is_empty()
            || value == "."
            || value.contains("..")
            || value.contains(['/', '\\', '\0'])
        {
            return Err(ClusterError::Invalid {
                id: id.to_string(),
                reason: format!("{} '{}' is not a valid path segment", field, value),
            });
        }
        Ok(())
    };
    check("kind", id.kind.as_str())?;
    if let Some(namespace) = &id.namespace {
        check("namespace", namespace)?;
    }
    check("name", &id.name)
}

/// Reject descriptors no backend can store
pub(crate) fn validate_resource(resource: &ResourceDescriptor) -> Result<(), ClusterError> {
    validate_id(&resource.id())?;
    if !resource.spec.is_object() {
        return Err(ClusterError::Invalid {
            id: resource.id().to_string(),
            reason: "manifest must be an object".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use librudder_core::ResourceKind;
    use serde_json::json;

    #[test]
    fn test_retryable_classification() {
        let conflict = ClusterError::Conflict {
            id: "ConfigMap/default/cfg".to_string(),
            expected: "1".to_string(),
            actual: "2".to_string(),
        };
        assert!(conflict.is_retryable());
        assert!(ClusterError::Timeout("get".to_string()).is_retryable());
        assert!(ClusterError::Unavailable("down".to_string()).is_retryable());

        let rejected = ClusterError::AdmissionRejected {
            id: "Pod/default/p".to_string(),
            reason: "privileged".to_string(),
        };
        assert!(!rejected.is_retryable());
        let record = rejected.to_operation_error();
        assert_eq!(record.code, "admission_rejected");
        assert!(record.terminal);

        assert!(!ClusterError::NotFound("x".to_string()).is_retryable());
    }

    #[test]
    fn test_validate_resource() {
        let ok = ResourceDescriptor::new(ResourceKind::ConfigMap, Some("default"), "cfg", json!({}));
        assert!(validate_resource(&ok).is_ok());

        let bad_name =
            ResourceDescriptor::new(ResourceKind::ConfigMap, Some("default"), "../etc", json!({}));
        assert!(matches!(validate_resource(&bad_name), Err(ClusterError::Invalid { .. })));

        for namespace in ["../../escaped", "a/b", "a\\b", "", ".."] {
            let escaping = ResourceDescriptor::new(ResourceKind::ConfigMap, Some(namespace), "cfg", json!({}));
            assert!(
                matches!(validate_resource(&escaping), Err(ClusterError::Invalid { .. })),
                "namespace {:?} accepted",
                namespace
            );
        }

        let bad_kind = ResourceDescriptor::new(ResourceKind::from("../Secret"), Some("default"), "cfg", json!({}));
        assert!(matches!(validate_resource(&bad_kind), Err(ClusterError::Invalid { .. })));

        let bad_spec =
            ResourceDescriptor::new(ResourceKind::ConfigMap, Some("default"), "cfg", json!([1]));
        assert!(matches!(validate_resource(&bad_spec), Err(ClusterError::Invalid { .. })));
    }
}
