//! Worker module - reconciliation loop for a single application
//!
//! Each worker owns one application's state machine:
//! `Idle -> Polling -> Diffing -> Syncing -> Idle`, with `Degraded` entered
//! after a pass with failed operations and left after a pass that fully
//! succeeds. Passes run as spawned tasks that report back over an internal
//! channel, so the worker keeps answering triggers and queries mid-pass.
//! At most one pass (or drift check) is in flight; triggers arriving
//! meanwhile collapse into a single pending request.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use librudder_core::{
    diff, Application, ApplicationState, DiffResult, HistoryStore, ManifestRenderer, OperationState,
    PassTrigger, RevisionSnapshot, SyncResult, SyncStatus,
};
use librudder_git::GitError;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, ClusterError};
use crate::error::DaemonError;
use crate::executor::{StaleFlag, SyncExecutor};
use crate::notifications::{Notification, Notifier};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::source::SourceFetcher;

/// Message sent to a worker
#[derive(Debug)]
pub enum WorkerMessage {
    /// Scheduled (or manual) poll of the source
    Poll,
    /// External change notification, carrying the pushed commit when known
    Refresh { revision: Option<String> },
    /// Explicit sync request; applies even under a manual policy
    Sync,
    /// Compare live state with the last synced snapshot
    DriftCheck,
    /// Query the worker's current status
    Status {
        response_tx: oneshot::Sender<WorkerStatus>,
    },
    /// Shutdown the worker
    Shutdown,
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub application: String,
    pub state: ApplicationState,
    /// Trigger of the pass currently running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<PassTrigger>,
    /// Coalesced trigger waiting for the current pass to finish
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PassTrigger>,
    /// Commit of the last snapshot known to be live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_revision: Option<String>,
}

/// Intervals driving a worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub drift_check_interval: Duration,
    /// Run a pass as soon as the worker starts
    pub initial_pass: bool,
}

/// Everything a pass needs besides the application itself
pub struct PassContext {
    pub source: Arc<dyn SourceFetcher>,
    pub renderer: Arc<dyn ManifestRenderer>,
    pub cluster: Arc<dyn ClusterApi>,
    pub history: HistoryStore,
    pub notifier: Notifier,
    pub retry: RetryConfig,
    pub max_concurrent_ops: usize,
}

/// Reported by pass and drift-check tasks back to the worker
enum PassEvent {
    Progress(ApplicationState),
    Finished(PassOutcome),
    DriftObserved(Result<DiffResult, String>),
}

struct PassOutcome {
    result: SyncResult,
    /// Snapshot now known to be live, if the pass established one
    synced: Option<Arc<RevisionSnapshot>>,
}

enum Activity {
    Pass(PassTrigger),
    DriftCheck,
}

struct InFlight {
    activity: Activity,
    stale: StaleFlag,
    /// Commit being synced, once the fetch has resolved it
    commit: Arc<OnceLock<String>>,
    handle: JoinHandle<()>,
}

/// Reconciliation worker for one application
pub struct Worker {
    app: Arc<Application>,
    rx: mpsc::Receiver<WorkerMessage>,
    context: Arc<PassContext>,
    settings: WorkerSettings,
    state: ApplicationState,
    degraded: bool,
    pending: Option<PassTrigger>,
    in_flight: Option<InFlight>,
    last_synced: Option<Arc<RevisionSnapshot>>,
    events_tx: mpsc::UnboundedSender<PassEvent>,
    events_rx: mpsc::UnboundedReceiver<PassEvent>,
    stopping: bool,
}

enum Wake {
    Message(Option<WorkerMessage>),
    Event(PassEvent),
    PollTick,
    DriftTick,
}

impl Worker {
    pub fn new(
        app: Application,
        rx: mpsc::Receiver<WorkerMessage>,
        context: PassContext,
        settings: WorkerSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            app: Arc::new(app),
            rx,
            context: Arc::new(context),
            settings,
            state: ApplicationState::Idle,
            degraded: false,
            pending: None,
            in_flight: None,
            last_synced: None,
            events_tx,
            events_rx,
            stopping: false,
        }
    }

    /// Run the worker event loop
    pub async fn run(mut self) {
        info!(app = %self.app.name, "Worker started");
        self.context
            .notifier
            .publish(Notification::worker_started(&self.app.name));

        let start = Instant::now();
        let mut poll = interval_at(start + self.settings.poll_interval, self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drift = interval_at(
            start + self.settings.drift_check_interval,
            self.settings.drift_check_interval,
        );
        drift.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.settings.initial_pass {
            self.request(PassTrigger::Poll);
        }

        loop {
            let wake = tokio::select! {
                msg = self.rx.recv() => Wake::Message(msg),
                Some(event) = self.events_rx.recv() => Wake::Event(event),
                _ = poll.tick() => Wake::PollTick,
                _ = drift.tick() => Wake::DriftTick,
            };

            match wake {
                Wake::Message(None) | Wake::Message(Some(WorkerMessage::Shutdown)) => {
                    info!(app = %self.app.name, "Worker shutdown requested");
                    break;
                }
                Wake::Message(Some(msg)) => self.handle_message(msg),
                Wake::Event(event) => self.handle_event(event),
                Wake::PollTick => self.request(PassTrigger::Poll),
                Wake::DriftTick => self.drift_check(),
            }
        }

        self.shutdown().await;
    }

    fn handle_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Poll => self.request(PassTrigger::Poll),
            WorkerMessage::Refresh { revision } => {
                if let Some(revision) = revision {
                    self.mark_stale_if_behind(&revision);
                }
                self.request(PassTrigger::Refresh);
            }
            WorkerMessage::Sync => self.request(PassTrigger::Sync),
            WorkerMessage::DriftCheck => self.drift_check(),
            WorkerMessage::Status { response_tx } => {
                let _ = response_tx.send(self.status());
            }
            WorkerMessage::Shutdown => {}
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            application: self.app.name.clone(),
            state: self.state,
            in_flight: self.in_flight.as_ref().and_then(|f| match f.activity {
                Activity::Pass(trigger) => Some(trigger),
                Activity::DriftCheck => None,
            }),
            pending: self.pending,
            synced_commit: self.last_synced.as_ref().map(|s| s.commit().to_string()),
            synced_revision: self.last_synced.as_ref().map(|s| s.hash_hex()),
        }
    }

    /// A pushed revision that differs from the commit being synced
    /// makes the in-flight pass stale
    fn mark_stale_if_behind(&self, revision: &str) {
        let Some(in_flight) = &self.in_flight else {
            return;
        };
        if !matches!(in_flight.activity, Activity::Pass(_)) {
            return;
        }
        if let Some(commit) = in_flight.commit.get() {
            if commit != revision {
                info!(
                    app = %self.app.name,
                    syncing = %commit,
                    pushed = %revision,
                    "Newer revision arrived; marking pass stale"
                );
                in_flight.stale.mark();
            }
        }
    }

    /// Start a pass now, or fold the trigger into the pending request
    fn request(&mut self, trigger: PassTrigger) {
        if self.stopping {
            return;
        }
        if self.in_flight.is_some() {
            let merged = coalesce(self.pending, trigger);
            debug!(app = %self.app.name, trigger = ?trigger, pending = ?merged, "Pass in flight; coalescing");
            self.pending = Some(merged);
            return;
        }
        self.start_pass(trigger);
    }

    fn start_pass(&mut self, trigger: PassTrigger) {
        let stale = StaleFlag::new();
        let commit = Arc::new(OnceLock::new());

        info!(app = %self.app.name, trigger = ?trigger, "Starting pass");
        let handle = tokio::spawn(run_pass(
            self.context.clone(),
            self.app.clone(),
            trigger,
            stale.clone(),
            commit.clone(),
            self.events_tx.clone(),
        ));

        self.in_flight = Some(InFlight {
            activity: Activity::Pass(trigger),
            stale,
            commit,
            handle,
        });
        self.set_state(ApplicationState::Polling);
    }

    /// Diff live state against the last synced snapshot, off the loop
    fn drift_check(&mut self) {
        if self.stopping || self.in_flight.is_some() {
            return;
        }
        let Some(snapshot) = self.last_synced.clone() else {
            debug!(app = %self.app.name, "No synced snapshot yet; skipping drift check");
            return;
        };

        let context = self.context.clone();
        let app = self.app.clone();
        let events = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            let observed = match context.cluster.list(&app.name).await {
                Ok(live) => diff(snapshot.resources(), &live, app.sync_policy.prune)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(PassEvent::DriftObserved(observed));
        });

        self.in_flight = Some(InFlight {
            activity: Activity::DriftCheck,
            stale: StaleFlag::new(),
            commit: Arc::new(OnceLock::new()),
            handle,
        });
    }

    fn handle_event(&mut self, event: PassEvent) {
        match event {
            PassEvent::Progress(state) => {
                if matches!(
                    self.in_flight.as_ref().map(|f| &f.activity),
                    Some(Activity::Pass(_))
                ) {
                    self.set_state(state);
                }
            }
            PassEvent::Finished(outcome) => {
                self.in_flight = None;
                self.finish_pass(outcome);
                self.start_pending();
            }
            PassEvent::DriftObserved(observed) => {
                self.in_flight = None;
                self.handle_drift(observed);
                self.start_pending();
            }
        }
    }

    fn finish_pass(&mut self, outcome: PassOutcome) {
        let result = outcome.result;

        if let Err(e) = self.context.history.record(&result) {
            error!(app = %self.app.name, error = %e, "Failed to record sync result");
        }

        if let Some(snapshot) = outcome.synced {
            self.last_synced = Some(snapshot);
        }

        let fully_applied = result.applied
            && !result.superseded
            && result
                .operations
                .iter()
                .all(|op| op.state == OperationState::Succeeded);
        if result.failed_count() > 0 {
            self.degraded = true;
        } else if result.status == SyncStatus::Synced || fully_applied {
            self.degraded = false;
        }

        info!(
            app = %self.app.name,
            pass = %result.pass_id,
            trigger = ?result.trigger,
            status = %result.status,
            commit = result.commit.as_deref().unwrap_or("-"),
            operations = result.operations.len(),
            succeeded = result.succeeded_count(),
            failed = result.failed_count(),
            superseded = result.superseded,
            "Pass completed"
        );

        self.context.notifier.publish(Notification::PassCompleted {
            application: self.app.name.clone(),
            pass_id: result.pass_id,
            status: result.status,
            commit: result.commit.clone(),
            superseded: result.superseded,
        });

        let resting = if self.degraded {
            ApplicationState::Degraded
        } else {
            ApplicationState::Idle
        };
        self.set_state(resting);
    }

    fn handle_drift(&mut self, observed: Result<DiffResult, String>) {
        let drift = match observed {
            Ok(drift) => drift,
            Err(e) => {
                warn!(app = %self.app.name, error = %e, "Drift check failed");
                return;
            }
        };
        if drift.operations.is_empty() {
            debug!(app = %self.app.name, "No drift");
            return;
        }

        let resources: Vec<String> = drift
            .operations
            .iter()
            .map(|op| op.resource_id().to_string())
            .collect();
        let self_heal = self.app.sync_policy.self_heal;

        self.context.notifier.publish(Notification::DriftDetected {
            application: self.app.name.clone(),
            resources: resources.clone(),
            self_heal,
        });

        if self_heal {
            warn!(app = %self.app.name, resources = ?resources, "Live drift detected; self-healing");
            self.request(PassTrigger::SelfHeal);
        } else {
            warn!(
                app = %self.app.name,
                resources = ?resources,
                "Live drift detected; self-heal disabled, waiting for next poll"
            );
        }
    }

    fn start_pending(&mut self) {
        if self.stopping || self.in_flight.is_some() {
            return;
        }
        if let Some(trigger) = self.pending.take() {
            debug!(app = %self.app.name, trigger = ?trigger, "Starting coalesced pass");
            self.start_pass(trigger);
        }
    }

    fn set_state(&mut self, state: ApplicationState) {
        if self.state == state {
            return;
        }
        debug!(app = %self.app.name, from = %self.state, to = %state, "State changed");
        self.context
            .notifier
            .publish(Notification::state_changed(&self.app.name, self.state, state));
        self.state = state;
    }

    /// Let an in-flight pass stop at its next phase boundary and record it
    async fn shutdown(&mut self) {
        self.stopping = true;
        self.pending = None;

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.stale.mark();
            if let Err(e) = in_flight.handle.await {
                error!(app = %self.app.name, error = %e, "In-flight task failed during shutdown");
            }
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event);
            }
        }

        self.context
            .notifier
            .publish(Notification::worker_stopped(&self.app.name));
        info!(app = %self.app.name, "Worker stopped");
    }
}

/// Keep the strongest of two triggers: an explicit sync outranks self-heal,
/// which outranks refresh, which outranks poll
fn coalesce(pending: Option<PassTrigger>, incoming: PassTrigger) -> PassTrigger {
    fn rank(trigger: PassTrigger) -> u8 {
        match trigger {
            PassTrigger::Poll => 0,
            PassTrigger::Refresh => 1,
            PassTrigger::SelfHeal => 2,
            PassTrigger::Sync => 3,
        }
    }
    match pending {
        Some(current) if rank(current) >= rank(incoming) => current,
        _ => incoming,
    }
}

async fn run_pass(
    context: Arc<PassContext>,
    app: Arc<Application>,
    trigger: PassTrigger,
    stale: StaleFlag,
    commit: Arc<OnceLock<String>>,
    events: mpsc::UnboundedSender<PassEvent>,
) {
    let mut result = SyncResult::new(&app.name, trigger, Utc::now());

    let outcome = match reconcile(&context, &app, trigger, &stale, &commit, &events, &mut result).await {
        Ok((status, synced)) => PassOutcome {
            result: result.finish(status),
            synced,
        },
        Err(e) => {
            error!(app = %app.name, code = e.error_code(), error = %e, "Pass failed");
            PassOutcome {
                result: result.failed(e.to_string()),
                synced: None,
            }
        }
    };

    let _ = events.send(PassEvent::Finished(outcome));
}

/// Fetch, render, diff and (if allowed) apply.
///
/// Fills `result` as it goes; returns the pass status and the snapshot that
/// is now live, if any.
async fn reconcile(
    context: &PassContext,
    app: &Application,
    trigger: PassTrigger,
    stale: &StaleFlag,
    commit: &OnceLock<String>,
    events: &mpsc::UnboundedSender<PassEvent>,
    result: &mut SyncResult,
) -> Result<(SyncStatus, Option<Arc<RevisionSnapshot>>), DaemonError> {
    let tree = retry_with_backoff(
        &context.retry,
        "git_fetch",
        GitError::is_retryable,
        || context.source.fetch(&app.source),
    )
    .await?;

    let _ = commit.set(tree.commit.clone());
    result.commit = Some(tree.commit.clone());
    let _ = events.send(PassEvent::Progress(ApplicationState::Diffing));

    let desired = context.renderer.render(app, &tree)?;
    let snapshot = Arc::new(RevisionSnapshot::new(tree.commit.clone(), desired)?);
    result.revision = Some(snapshot.hash_hex());

    let live = retry_with_backoff(
        &context.retry,
        "cluster_list",
        ClusterError::is_retryable,
        || context.cluster.list(&app.name),
    )
    .await?;

    let planned = diff(snapshot.resources(), &live, app.sync_policy.prune)?;
    result.drift = planned.drift.clone();

    info!(
        app = %app.name,
        commit = %tree.commit,
        revision = %snapshot.hash_hex(),
        operations = planned.operations.len(),
        drift = planned.drift.len(),
        "Computed diff"
    );

    if planned.operations.is_empty() {
        let status = SyncStatus::aggregate(&[], &planned.drift);
        return Ok((status, Some(snapshot)));
    }

    if !(app.sync_policy.automated || trigger.forces_apply()) {
        info!(
            app = %app.name,
            operations = planned.operations.len(),
            "Manual sync policy; leaving operations pending"
        );
        result.operations = planned.operations;
        return Ok((SyncStatus::OutOfSync, None));
    }

    let _ = events.send(PassEvent::Progress(ApplicationState::Syncing));
    result.applied = true;

    let executor = SyncExecutor::new(
        context.cluster.clone(),
        &app.name,
        context.retry.clone(),
        context.max_concurrent_ops,
    );
    let report = executor.execute(planned.operations, stale).await;

    let status = SyncStatus::aggregate(&report.operations, &planned.drift);
    let synced = report.all_succeeded().then_some(snapshot);
    result.superseded = report.superseded;
    result.operations = report.operations;

    Ok((status, synced))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_keeps_strongest_trigger() {
        assert_eq!(coalesce(None, PassTrigger::Poll), PassTrigger::Poll);
        assert_eq!(coalesce(Some(PassTrigger::Poll), PassTrigger::Refresh), PassTrigger::Refresh);
        assert_eq!(coalesce(Some(PassTrigger::Sync), PassTrigger::Poll), PassTrigger::Sync);
        assert_eq!(coalesce(Some(PassTrigger::Refresh), PassTrigger::SelfHeal), PassTrigger::SelfHeal);
        assert_eq!(coalesce(Some(PassTrigger::SelfHeal), PassTrigger::Sync), PassTrigger::Sync);
    }
}
