use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::operation::{OperationState, SyncOperation};
use crate::types::resource::ResourceId;

/// Overall outcome of a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Live state matches the rendered snapshot
    Synced,
    /// Live state differs and nothing (or not everything) was applied
    OutOfSync,
    /// Some operations failed with transient errors
    Degraded,
    /// A terminal failure: the pass could not complete
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::OutOfSync => "out_of_sync",
            SyncStatus::Degraded => "degraded",
            SyncStatus::Error => "error",
        }
    }

    /// Status of an executed pass, from its operation outcomes and drift.
    ///
    /// Terminal failures win over transient ones. Operations left Pending
    /// (a halted or superseded pass) leave the application out of sync.
    pub fn aggregate(operations: &[SyncOperation], drift: &[ResourceId]) -> SyncStatus {
        if operations.iter().any(SyncOperation::is_terminal_failure) {
            return SyncStatus::Error;
        }
        if operations.iter().any(SyncOperation::is_failed) {
            return SyncStatus::Degraded;
        }
        let pending = operations
            .iter()
            .any(|op| op.state == OperationState::Pending);
        if pending || !drift.is_empty() {
            SyncStatus::OutOfSync
        } else {
            SyncStatus::Synced
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassTrigger {
    /// Scheduled polling interval (or controller startup)
    Poll,
    /// External notification such as a push webhook
    Refresh,
    /// Explicit sync request; applies even under a manual policy
    Sync,
    /// Live drift observed with self-heal enabled
    SelfHeal,
}

impl PassTrigger {
    /// Whether this trigger applies operations regardless of `automated`.
    ///
    /// Self-heal passes only exist when `self_heal` is enabled, which is
    /// itself a request to apply.
    pub fn forces_apply(&self) -> bool {
        matches!(self, PassTrigger::Sync | PassTrigger::SelfHeal)
    }
}

/// Terminal record of one reconciliation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub pass_id: Uuid,
    pub application: String,
    pub trigger: PassTrigger,
    /// Commit the snapshot was rendered from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Content hash of the rendered snapshot (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub status: SyncStatus,
    pub operations: Vec<SyncOperation>,
    /// Live resources absent from desired state that were left in place
    #[serde(default)]
    pub drift: Vec<ResourceId>,
    /// Whether operations were submitted to the cluster
    #[serde(default)]
    pub applied: bool,
    /// Set when a newer revision arrived while this pass was syncing
    #[serde(default)]
    pub superseded: bool,
    /// Pass-level failure (fetch, render, cluster listing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    pub fn new(application: &str, trigger: PassTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            application: application.to_string(),
            trigger,
            commit: None,
            revision: None,
            status: SyncStatus::OutOfSync,
            operations: Vec::new(),
            drift: Vec::new(),
            applied: false,
            superseded: false,
            message: None,
            started_at,
            finished_at: started_at,
        }
    }

    /// Close the record as a pass-level failure
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = SyncStatus::Error;
        self.message = Some(message.into());
        self.finished_at = Utc::now();
        self
    }

    pub fn finish(mut self, status: SyncStatus) -> Self {
        self.status = status;
        self.finished_at = Utc::now();
        self
    }

    pub fn succeeded_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.state == OperationState::Succeeded)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.operations.iter().filter(|op| op.is_failed()).count()
    }
}
