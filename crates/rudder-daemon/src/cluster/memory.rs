//! In-process cluster backend
//!
//! Keeps live resources in memory with monotonically increasing version
//! tokens. Faults, held writes and external mutations can be injected to
//! exercise the executor's retry and drift handling.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use librudder_core::{OperationKind, ResourceDescriptor, ResourceId};
use serde_json::Value;
use tokio::sync::watch;

use super::{validate_resource, ClusterApi, ClusterError};

/// A failure injected into the next write(s) of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Another writer bumps the version first
    Conflict,
    Timeout,
    Unavailable,
    AdmissionRejected(String),
    Invalid(String),
}

struct StoredObject {
    owner: String,
    resource: ResourceDescriptor,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ResourceId, StoredObject>,
    next_version: u64,
    one_shot_faults: HashMap<ResourceId, VecDeque<Fault>>,
    persistent_faults: HashMap<ResourceId, Fault>,
    unavailable: bool,
    write_attempts: HashMap<ResourceId, u32>,
    write_log: Vec<(OperationKind, ResourceId)>,
}

impl MemoryState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn current_version(&self, id: &ResourceId) -> Option<String> {
        self.objects
            .get(id)
            .and_then(|obj| obj.resource.resource_version.clone())
    }

    fn check_version(&self, id: &ResourceId, expected: Option<&str>) -> Result<(), ClusterError> {
        let current = self
            .current_version(id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        match expected {
            Some(expected) if expected != current => Err(ClusterError::Conflict {
                id: id.to_string(),
                expected: expected.to_string(),
                actual: current,
            }),
            _ => Ok(()),
        }
    }
}

/// Cluster backend held entirely in memory
pub struct MemoryCluster {
    state: Mutex<MemoryState>,
    /// `true` while writes are held
    gate: watch::Sender<bool>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            state: Mutex::new(MemoryState::default()),
            gate,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next write to `id` with `fault`; queued faults fire in order
    pub fn fail_next(&self, id: &ResourceId, fault: Fault) {
        self.lock()
            .one_shot_faults
            .entry(id.clone())
            .or_default()
            .push_back(fault);
    }

    /// Fail every write to `id` with `fault`
    pub fn fail_always(&self, id: &ResourceId, fault: Fault) {
        self.lock().persistent_faults.insert(id.clone(), fault);
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.one_shot_faults.clear();
        state.persistent_faults.clear();
    }

    /// Make every call fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Block writes until [`release_writes`](Self::release_writes)
    pub fn hold_writes(&self) {
        self.gate.send_replace(true);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(false);
    }

    /// Change a live resource behind the controller's back.
    ///
    /// Returns the new version, or `None` if the resource does not exist.
    pub fn mutate_externally(&self, id: &ResourceId, spec: Value) -> Option<String> {
        let mut state = self.lock();
        if !state.objects.contains_key(id) {
            return None;
        }
        let version = state.bump_version();
        let obj = state.objects.get_mut(id)?;
        obj.resource.spec = spec;
        obj.resource.resource_version = Some(version.clone());
        Some(version)
    }

    /// Delete a live resource behind the controller's back
    pub fn delete_externally(&self, id: &ResourceId) -> bool {
        self.lock().objects.remove(id).is_some()
    }

    /// Seed a live resource under `owner`; returns its version
    pub fn insert_external(&self, owner: &str, resource: ResourceDescriptor) -> String {
        let mut state = self.lock();
        let version = state.bump_version();
        let resource = resource.with_resource_version(version.clone());
        state.objects.insert(
            resource.id(),
            StoredObject {
                owner: owner.to_string(),
                resource,
            },
        );
        version
    }

    /// Live descriptor, bypassing faults
    pub fn object(&self, id: &ResourceId) -> Option<ResourceDescriptor> {
        self.lock().objects.get(id).map(|obj| obj.resource.clone())
    }

    /// Live descriptors tracked under `owner`, bypassing faults
    pub fn owned_by(&self, owner: &str) -> Vec<ResourceDescriptor> {
        self.lock()
            .objects
            .values()
            .filter(|obj| obj.owner == owner)
            .map(|obj| obj.resource.clone())
            .collect()
    }

    /// Write calls received for `id`, including failed ones
    pub fn write_attempts(&self, id: &ResourceId) -> u32 {
        self.lock().write_attempts.get(id).copied().unwrap_or(0)
    }

    /// Successful writes in the order they were applied
    pub fn write_log(&self) -> Vec<(OperationKind, ResourceId)> {
        self.lock().write_log.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), ClusterError> {
        if self.lock().unavailable {
            return Err(ClusterError::Unavailable("memory cluster offline".to_string()));
        }
        Ok(())
    }

    /// Run one write: wait for the gate, then apply faults and `f`
    async fn write<T, F>(&self, kind: OperationKind, id: &ResourceId, f: F) -> Result<T, ClusterError>
    where
        F: FnOnce(&mut MemoryState) -> Result<T, ClusterError>,
    {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        let mut guard = self.lock();
        let state = &mut *guard;
        *state.write_attempts.entry(id.clone()).or_insert(0) += 1;

        if state.unavailable {
            return Err(ClusterError::Unavailable("memory cluster offline".to_string()));
        }

        let fault = state
            .one_shot_faults
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.persistent_faults.get(id).cloned());

        if let Some(fault) = fault {
            return Err(match fault {
                Fault::Conflict => {
                    let actual = if state.objects.contains_key(id) {
                        let version = state.bump_version();
                        if let Some(obj) = state.objects.get_mut(id) {
                            obj.resource.resource_version = Some(version.clone());
                        }
                        version
                    } else {
                        "none".to_string()
                    };
                    ClusterError::Conflict {
                        id: id.to_string(),
                        expected: "stale".to_string(),
                        actual,
                    }
                }
                Fault::Timeout => ClusterError::Timeout(format!("{} {}", kind, id)),
                Fault::Unavailable => ClusterError::Unavailable(format!("{} {}", kind, id)),
                Fault::AdmissionRejected(reason) => ClusterError::AdmissionRejected {
                    id: id.to_string(),
                    reason,
                },
                Fault::Invalid(reason) => ClusterError::Invalid {
                    id: id.to_string(),
                    reason,
                },
            });
        }

        let value = f(state)?;
        state.write_log.push((kind, id.clone()));
        Ok(value)
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, ClusterError> {
        self.check_available()?;
        Ok(self.object(id))
    }

    async fn list(&self, owner: &str) -> Result<Vec<ResourceDescriptor>, ClusterError> {
        self.check_available()?;
        Ok(self.owned_by(owner))
    }

    async fn create(&self, owner: &str, resource: &ResourceDescriptor) -> Result<String, ClusterError> {
        validate_resource(resource)?;
        let id = resource.id();
        self.write(OperationKind::Create, &id, |state| {
            if state.objects.contains_key(&id) {
                return Err(ClusterError::AlreadyExists(id.to_string()));
            }
            let version = state.bump_version();
            let stored = resource.clone().with_resource_version(version.clone());
            state.objects.insert(
                id.clone(),
                StoredObject {
                    owner: owner.to_string(),
                    resource: stored,
                },
            );
            Ok(version)
        })
        .await
    }

    async fn update(
        &self,
        owner: &str,
        resource: &ResourceDescriptor,
        expected_version: Option<&str>,
    ) -> Result<String, ClusterError> {
        validate_resource(resource)?;
        let id = resource.id();
        self.write(OperationKind::Update, &id, |state| {
            state.check_version(&id, expected_version)?;
            let version = state.bump_version();
            let stored = resource.clone().with_resource_version(version.clone());
            state.objects.insert(
                id.clone(),
                StoredObject {
                    owner: owner.to_string(),
                    resource: stored,
                },
            );
            Ok(version)
        })
        .await
    }

    async fn delete(&self, id: &ResourceId, expected_version: Option<&str>) -> Result<(), ClusterError> {
        self.write(OperationKind::Delete, id, |state| {
            state.check_version(id, expected_version)?;
            state.objects.remove(id);
            Ok(())
        })
        .await
    }
}
