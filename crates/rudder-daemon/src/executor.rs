//! Sync executor
//!
//! Applies an ordered operation list one phase at a time. Operations within
//! a phase run concurrently, bounded by a semaphore; the next phase starts
//! only after every operation of the current one has finished. A failed
//! phase halts the pass, and a pass marked stale does not start new phases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use librudder_core::diff::sort_operations;
use librudder_core::types::OperationError;
use librudder_core::{OperationKind, OperationState, SyncOperation};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, ClusterError};
use crate::retry::{Backoff, RetryConfig};

/// Set when a newer revision makes an in-flight pass obsolete
#[derive(Debug, Clone, Default)]
pub struct StaleFlag(Arc<AtomicBool>);

impl StaleFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of executing an operation list
#[derive(Debug)]
pub struct ExecutionReport {
    /// Every operation, in apply order, with its final state
    pub operations: Vec<SyncOperation>,
    /// The pass went stale and stopped before a phase boundary
    pub superseded: bool,
}

impl ExecutionReport {
    pub fn all_succeeded(&self) -> bool {
        self.operations
            .iter()
            .all(|op| op.state == OperationState::Succeeded)
    }
}

/// Applies sync operations against one cluster on behalf of one owner
pub struct SyncExecutor {
    cluster: Arc<dyn ClusterApi>,
    owner: Arc<str>,
    retry: RetryConfig,
    max_concurrent_ops: usize,
}

impl SyncExecutor {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        owner: &str,
        retry: RetryConfig,
        max_concurrent_ops: usize,
    ) -> Self {
        Self {
            cluster,
            owner: Arc::from(owner),
            retry,
            max_concurrent_ops: max_concurrent_ops.max(1),
        }
    }

    pub async fn execute(&self, mut operations: Vec<SyncOperation>, stale: &StaleFlag) -> ExecutionReport {
        sort_operations(&mut operations);

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_ops));
        let mut superseded = false;
        let mut start = 0;

        while start < operations.len() {
            let phase = operations[start].phase;
            if stale.is_stale() {
                info!(
                    owner = %self.owner,
                    phase = %phase,
                    "Pass superseded by a newer revision; not starting phase"
                );
                superseded = true;
                break;
            }

            let end = start
                + operations[start..]
                    .iter()
                    .take_while(|op| op.phase == phase)
                    .count();

            debug!(owner = %self.owner, phase = %phase, operations = end - start, "Starting phase");

            let mut tasks = JoinSet::new();
            for (index, op) in operations.iter().enumerate().take(end).skip(start) {
                let op = op.clone();
                let cluster = self.cluster.clone();
                let owner = self.owner.clone();
                let retry = self.retry.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (index, apply_with_retry(cluster.as_ref(), &owner, &retry, op).await)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, op)) => operations[index] = op,
                    Err(e) => error!(owner = %self.owner, error = %e, "Operation task failed"),
                }
            }

            // A task that died without reporting leaves its operation pending
            for op in &mut operations[start..end] {
                if op.state == OperationState::Pending {
                    op.fail(OperationError {
                        code: "executor_task_failed".to_string(),
                        message: "operation task ended without a result".to_string(),
                        terminal: false,
                    });
                }
            }

            let failed = operations[start..end].iter().filter(|op| op.is_failed()).count();
            if failed > 0 {
                warn!(
                    owner = %self.owner,
                    phase = %phase,
                    failed,
                    "Phase failed; halting pass"
                );
                break;
            }
            start = end;
        }

        ExecutionReport {
            operations,
            superseded,
        }
    }
}

/// Apply one operation, retrying transient failures.
///
/// On a conflict the live resource version is re-read before the next try.
async fn apply_with_retry(
    cluster: &dyn ClusterApi,
    owner: &str,
    retry: &RetryConfig,
    mut op: SyncOperation,
) -> SyncOperation {
    let mut backoff = Backoff::new(retry);

    loop {
        op.attempts += 1;
        match apply_once(cluster, owner, &op).await {
            Ok(version) => {
                if version.is_some() {
                    op.resource.resource_version = version;
                }
                op.succeed();
                debug!(owner = %owner, operation = %op, attempts = op.attempts, "Applied");
                return op;
            }
            Err(e) if e.is_retryable() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        owner = %owner,
                        operation = %op,
                        attempt = op.attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if matches!(e, ClusterError::Conflict { .. }) {
                        refresh_expected_version(cluster, &mut op).await;
                    }
                }
                None => {
                    error!(
                        owner = %owner,
                        operation = %op,
                        attempt = op.attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    op.fail(e.to_operation_error());
                    return op;
                }
            },
            Err(e) => {
                error!(owner = %owner, operation = %op, error = %e, "Operation rejected");
                op.fail(e.to_operation_error());
                return op;
            }
        }
    }
}

async fn apply_once(
    cluster: &dyn ClusterApi,
    owner: &str,
    op: &SyncOperation,
) -> Result<Option<String>, ClusterError> {
    let expected = op.expected_version.as_deref();
    match op.kind {
        OperationKind::Create => cluster.create(owner, &op.resource).await.map(Some),
        OperationKind::Update => cluster.update(owner, &op.resource, expected).await.map(Some),
        OperationKind::Delete => cluster
            .delete(&op.resource_id(), expected)
            .await
            .map(|_| None),
    }
}

async fn refresh_expected_version(cluster: &dyn ClusterApi, op: &mut SyncOperation) {
    match cluster.get(&op.resource_id()).await {
        Ok(Some(live)) => {
            debug!(
                operation = %op,
                version = ?live.resource_version,
                "Re-read live version after conflict"
            );
            op.expected_version = live.resource_version;
        }
        Ok(None) => debug!(operation = %op, "Resource vanished after conflict"),
        Err(e) => warn!(operation = %op, error = %e, "Failed to re-read live version"),
    }
}
