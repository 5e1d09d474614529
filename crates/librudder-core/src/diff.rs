//! Desired-state differ
//!
//! Groups desired and live descriptors by identity and emits the
//! create/update/delete operations that bring live state to desired state,
//! ordered by the fixed phase table and then by identity.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::CoreError;
use crate::types::operation::SyncOperation;
use crate::types::resource::{ResourceDescriptor, ResourceId};

/// Output of a diff
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffResult {
    /// Operations in apply order
    pub operations: Vec<SyncOperation>,
    /// Live-only resources left in place because pruning is disabled
    pub drift: Vec<ResourceId>,
}

impl DiffResult {
    /// No operations to apply (drift may still be present)
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Live state matches desired state exactly
    pub fn in_sync(&self) -> bool {
        self.operations.is_empty() && self.drift.is_empty()
    }
}

/// Compute the ordered operation list turning `actual` into `desired`.
///
/// Duplicate identities in `desired` are rejected; for `actual` the last
/// occurrence wins.
pub fn diff(
    desired: &[ResourceDescriptor],
    actual: &[ResourceDescriptor],
    prune: bool,
) -> Result<DiffResult, CoreError> {
    let mut wanted: BTreeMap<ResourceId, &ResourceDescriptor> = BTreeMap::new();
    for resource in desired {
        if wanted.insert(resource.id(), resource).is_some() {
            return Err(CoreError::DuplicateResource(resource.id().to_string()));
        }
    }

    let live: BTreeMap<ResourceId, &ResourceDescriptor> =
        actual.iter().map(|r| (r.id(), r)).collect();

    let mut result = DiffResult::default();

    for (id, resource) in &wanted {
        match live.get(id) {
            None => result.operations.push(SyncOperation::create((*resource).clone())),
            Some(current) if !resource.semantically_eq(current) => {
                result.operations.push(SyncOperation::update(
                    (*resource).clone(),
                    current.resource_version.clone(),
                ));
            }
            Some(_) => {}
        }
    }

    for (id, current) in &live {
        if wanted.contains_key(id) {
            continue;
        }
        if prune {
            result.operations.push(SyncOperation::delete((*current).clone()));
        } else {
            result.drift.push(id.clone());
        }
    }

    sort_operations(&mut result.operations);
    Ok(result)
}

/// Sort by phase, then identity. Stable, so repeated diffs agree.
pub fn sort_operations(operations: &mut [SyncOperation]) {
    operations.sort_by(|a, b| {
        a.phase
            .cmp(&b.phase)
            .then_with(|| a.resource_id().cmp(&b.resource_id()))
    });
}
