use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::CoreError;
use crate::hash::{compute_snapshot_hash, SnapshotHash};
use crate::types::resource::{ResourceDescriptor, ResourceId};

/// Files fetched from Git at one commit, keyed by path relative to the source path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTree {
    /// Commit id (hex)
    pub commit: String,
    pub files: BTreeMap<String, Vec<u8>>,
}

impl SourceTree {
    pub fn new(commit: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }
}

/// Immutable, content-addressed rendered manifest set.
///
/// Resources are kept sorted by identity; the hash covers their normalized
/// payloads, so the same rendered set always hashes the same.
#[derive(Debug, Clone, Serialize)]
pub struct RevisionSnapshot {
    commit: String,
    hash: SnapshotHash,
    resources: Vec<ResourceDescriptor>,
}

impl RevisionSnapshot {
    /// Build a snapshot; duplicate identities are rejected.
    pub fn new(commit: impl Into<String>, mut resources: Vec<ResourceDescriptor>) -> Result<Self, CoreError> {
        resources.sort_by_key(|r| r.id());
        if let Some(pair) = resources.windows(2).find(|w| w[0].id() == w[1].id()) {
            return Err(CoreError::DuplicateResource(pair[0].id().to_string()));
        }
        let hash = compute_snapshot_hash(&resources);
        Ok(Self {
            commit: commit.into(),
            hash,
            resources,
        })
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn hash(&self) -> &SnapshotHash {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.resources.iter().map(ResourceDescriptor::id).collect()
    }
}
