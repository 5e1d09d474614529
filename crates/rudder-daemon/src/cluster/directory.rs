//! Directory-backed cluster
//!
//! Each live resource is one JSON file at
//! `<root>/<Kind>/<namespace or _cluster>/<name>.json` holding the owner and
//! the descriptor. Version tokens are random and change on every write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use librudder_core::{ResourceDescriptor, ResourceId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{validate_id, validate_resource, ClusterApi, ClusterError};

/// Directory name for cluster-scoped resources
const CLUSTER_SCOPE_DIR: &str = "_cluster";

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    owner: String,
    resource: ResourceDescriptor,
}

/// Cluster backend persisting resources as JSON files
pub struct DirectoryCluster {
    root: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl DirectoryCluster {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File for `id`; identities that would leave the root are rejected
    fn path_for(&self, id: &ResourceId) -> Result<PathBuf, ClusterError> {
        validate_id(id)?;
        let scope = id.namespace.as_deref().unwrap_or(CLUSTER_SCOPE_DIR);
        Ok(self
            .root
            .join(id.kind.as_str())
            .join(scope)
            .join(format!("{}.json", id.name)))
    }

    async fn read_record(path: &Path) -> Result<Option<StoredRecord>, ClusterError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(path: &Path, record: &StoredRecord) -> Result<(), ClusterError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn check_version(
        id: &ResourceId,
        record: &StoredRecord,
        expected: Option<&str>,
    ) -> Result<(), ClusterError> {
        let current = record.resource.resource_version.clone().unwrap_or_default();
        match expected {
            Some(expected) if expected != current => Err(ClusterError::Conflict {
                id: id.to_string(),
                expected: expected.to_string(),
                actual: current,
            }),
            _ => Ok(()),
        }
    }

    async fn store(&self, owner: &str, resource: &ResourceDescriptor, path: &Path) -> Result<String, ClusterError> {
        let version = Uuid::new_v4().simple().to_string();
        let record = StoredRecord {
            owner: owner.to_string(),
            resource: resource.clone().with_resource_version(version.clone()),
        };
        Self::write_record(path, &record).await?;
        debug!(resource = %resource.id(), version = %version, "Wrote resource");
        Ok(version)
    }

    /// Every `*.json` file two levels below the kind directories
    async fn record_paths(&self) -> Result<Vec<PathBuf>, ClusterError> {
        let mut paths = Vec::new();
        for kind_dir in read_dirs(&self.root).await? {
            for scope_dir in read_dirs(&kind_dir).await? {
                let mut entries = tokio::fs::read_dir(&scope_dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("json") {
                        paths.push(path);
                    }
                }
            }
        }
        paths.sort();
        Ok(paths)
    }
}

async fn read_dirs(path: &Path) -> Result<Vec<PathBuf>, ClusterError> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[async_trait]
impl ClusterApi for DirectoryCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, ClusterError> {
        Ok(Self::read_record(&self.path_for(id)?)
            .await?
            .map(|record| record.resource))
    }

    async fn list(&self, owner: &str) -> Result<Vec<ResourceDescriptor>, ClusterError> {
        let mut resources = Vec::new();
        for path in self.record_paths().await? {
            if let Some(record) = Self::read_record(&path).await? {
                if record.owner == owner {
                    resources.push(record.resource);
                }
            }
        }
        Ok(resources)
    }

    async fn create(&self, owner: &str, resource: &ResourceDescriptor) -> Result<String, ClusterError> {
        validate_resource(resource)?;
        let id = resource.id();
        let path = self.path_for(&id)?;

        let _guard = self.write_lock.lock().await;
        if Self::read_record(&path).await?.is_some() {
            return Err(ClusterError::AlreadyExists(id.to_string()));
        }
        self.store(owner, resource, &path).await
    }

    async fn update(
        &self,
        owner: &str,
        resource: &ResourceDescriptor,
        expected_version: Option<&str>,
    ) -> Result<String, ClusterError> {
        validate_resource(resource)?;
        let id = resource.id();
        let path = self.path_for(&id)?;

        let _guard = self.write_lock.lock().await;
        let record = Self::read_record(&path)
            .await?
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        Self::check_version(&id, &record, expected_version)?;
        self.store(owner, resource, &path).await
    }

    async fn delete(&self, id: &ResourceId, expected_version: Option<&str>) -> Result<(), ClusterError> {
        let path = self.path_for(id)?;

        let _guard = self.write_lock.lock().await;
        let record = Self::read_record(&path)
            .await?
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        Self::check_version(id, &record, expected_version)?;
        tokio::fs::remove_file(&path).await?;
        debug!(resource = %id, "Deleted resource");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use librudder_core::ResourceKind;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_roundtrip_on_disk() {
        let dir = tempdir().unwrap();
        let cluster = DirectoryCluster::new(dir.path());

        let ns = ResourceDescriptor::new(ResourceKind::Namespace, None, "web", json!({"kind": "Namespace"}));
        let cm = ResourceDescriptor::new(
            ResourceKind::ConfigMap,
            Some("web"),
            "cfg",
            json!({"data": {"a": "1"}}),
        );

        cluster.create("guestbook", &ns).await.unwrap();
        let v1 = cluster.create("guestbook", &cm).await.unwrap();
        assert!(dir.path().join("Namespace/_cluster/web.json").exists());
        assert!(dir.path().join("ConfigMap/web/cfg.json").exists());

        let listed = cluster.list("guestbook").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(cluster.list("other").await.unwrap().is_empty());

        let updated = ResourceDescriptor::new(
            ResourceKind::ConfigMap,
            Some("web"),
            "cfg",
            json!({"data": {"a": "2"}}),
        );
        let v2 = cluster.update("guestbook", &updated, Some(&v1)).await.unwrap();
        let err = cluster.update("guestbook", &updated, Some(&v1)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));

        let live = cluster.get(&cm.id()).await.unwrap().unwrap();
        assert_eq!(live.spec, json!({"data": {"a": "2"}}));
        assert_eq!(live.resource_version.as_deref(), Some(v2.as_str()));

        cluster.delete(&cm.id(), Some(&v2)).await.unwrap();
        assert!(cluster.get(&cm.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_empty_root() {
        let dir = tempdir().unwrap();
        let cluster = DirectoryCluster::new(dir.path().join("missing"));
        assert!(cluster.list("anything").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_cannot_escape_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cluster");
        let cluster = DirectoryCluster::new(&root);

        let escaping = ResourceDescriptor::new(
            ResourceKind::ConfigMap,
            Some("../../escaped"),
            "cfg",
            json!({"kind": "ConfigMap"}),
        );
        let err = cluster.create("app", &escaping).await.unwrap_err();
        assert!(matches!(err, ClusterError::Invalid { .. }));
        assert!(!dir.path().join("escaped").exists());
        assert!(!root.exists());

        let err = cluster.get(&escaping.id()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Invalid { .. }));
        let err = cluster.delete(&escaping.id(), None).await.unwrap_err();
        assert!(matches!(err, ClusterError::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_nested_namespace_is_rejected() {
        let dir = tempdir().unwrap();
        let cluster = DirectoryCluster::new(dir.path());

        let nested = ResourceDescriptor::new(
            ResourceKind::ConfigMap,
            Some("a/b"),
            "cfg",
            json!({"kind": "ConfigMap"}),
        );
        let err = cluster.create("app", &nested).await.unwrap_err();
        assert!(matches!(err, ClusterError::Invalid { .. }));
        assert!(!err.is_retryable());
        assert!(cluster.list("app").await.unwrap().is_empty());

        let bad_kind = ResourceDescriptor::new(
            ResourceKind::from("../Secret"),
            Some("web"),
            "cfg",
            json!({"kind": "../Secret"}),
        );
        assert!(matches!(
            cluster.create("app", &bad_kind).await,
            Err(ClusterError::Invalid { .. })
        ));
    }
}
