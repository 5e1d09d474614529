use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::resource::{ResourceDescriptor, ResourceId, SyncPhase};

/// What a sync operation does to its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Succeeded,
    Failed,
}

/// Why an operation failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Machine-readable code (e.g. "apply_conflict", "admission_rejected")
    pub code: String,
    pub message: String,
    /// Terminal errors are never retried and turn the pass into an Error
    pub terminal: bool,
}

/// One create/update/delete against the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub kind: OperationKind,
    /// Desired descriptor for create/update, live descriptor for delete
    pub resource: ResourceDescriptor,
    /// Ordering key
    pub phase: SyncPhase,
    /// Live resource version observed when the diff was computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<String>,
    pub state: OperationState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl SyncOperation {
    pub fn new(kind: OperationKind, resource: ResourceDescriptor, expected_version: Option<String>) -> Self {
        let phase = resource.phase();
        Self {
            kind,
            resource,
            phase,
            expected_version,
            state: OperationState::Pending,
            attempts: 0,
            error: None,
        }
    }

    pub fn create(resource: ResourceDescriptor) -> Self {
        Self::new(OperationKind::Create, resource, None)
    }

    pub fn update(resource: ResourceDescriptor, expected_version: Option<String>) -> Self {
        Self::new(OperationKind::Update, resource, expected_version)
    }

    pub fn delete(resource: ResourceDescriptor) -> Self {
        let expected_version = resource.resource_version.clone();
        Self::new(OperationKind::Delete, resource, expected_version)
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource.id()
    }

    pub fn succeed(&mut self) {
        self.state = OperationState::Succeeded;
        self.error = None;
    }

    pub fn fail(&mut self, error: OperationError) {
        self.state = OperationState::Failed;
        self.error = Some(error);
    }

    pub fn is_failed(&self) -> bool {
        self.state == OperationState::Failed
    }

    pub fn is_terminal_failure(&self) -> bool {
        self.is_failed() && self.error.as_ref().map(|e| e.terminal).unwrap_or(false)
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.resource.id())
    }
}
