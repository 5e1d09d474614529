//! Supervisor module - spawns one worker per application and routes triggers
//!
//! The supervisor:
//! - Builds a pass context per application (source, renderer, cluster client)
//! - Spawns and tracks worker tasks
//! - Routes refresh, sync and status requests by application name
//! - Logs every notification

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use librudder_core::{Application, ControllerConfig, HistoryStore, ManifestRenderer, SyncResult};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::ClusterPool;
use crate::error::DaemonError;
use crate::notifications::{Notification, Notifier};
use crate::retry::RetryConfig;
use crate::source::SourceFetcher;
use crate::worker::{PassContext, Worker, WorkerMessage, WorkerSettings, WorkerStatus};

/// Inbound queue depth per worker
const WORKER_QUEUE: usize = 64;

/// Worker handle for communication
struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
    application: Application,
}

/// Builds the controller from configuration and its collaborators
pub struct Supervisor {
    config: ControllerConfig,
    source: Arc<dyn SourceFetcher>,
    renderer: Arc<dyn ManifestRenderer>,
    clusters: ClusterPool,
    history: HistoryStore,
    notifier: Notifier,
    initial_pass: bool,
}

impl Supervisor {
    pub fn new(
        config: ControllerConfig,
        source: Arc<dyn SourceFetcher>,
        renderer: Arc<dyn ManifestRenderer>,
        clusters: ClusterPool,
        history: HistoryStore,
    ) -> Self {
        Self {
            config,
            source,
            renderer,
            clusters,
            history,
            notifier: Notifier::default(),
            initial_pass: true,
        }
    }

    /// Whether every worker runs a pass immediately on start (default: yes)
    pub fn with_initial_pass(mut self, initial_pass: bool) -> Self {
        self.initial_pass = initial_pass;
        self
    }

    /// Publish on `notifier` instead of a fresh default channel
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Spawn the workers and return a handle to them
    pub fn start(self) -> Result<ControllerHandle, DaemonError> {
        let settings = WorkerSettings {
            poll_interval: Duration::from_secs(self.config.poll_interval_secs),
            drift_check_interval: Duration::from_secs(self.config.drift_check_interval_secs),
            initial_pass: self.initial_pass,
        };
        let retry = RetryConfig::from(&self.config.retry);

        let mut workers = BTreeMap::new();
        let mut joins = Vec::new();

        for app in &self.config.applications {
            let cluster = self
                .clusters
                .get(&app.destination.server)
                .ok_or_else(|| DaemonError::ClusterNotFound(app.destination.server.clone()))?;

            let context = PassContext {
                source: self.source.clone(),
                renderer: self.renderer.clone(),
                cluster,
                history: self.history.clone(),
                notifier: self.notifier.clone(),
                retry: retry.clone(),
                max_concurrent_ops: self.config.max_concurrent_ops,
            };

            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            let worker = Worker::new(app.clone(), rx, context, settings.clone());
            joins.push(tokio::spawn(worker.run()));

            workers.insert(
                app.name.clone(),
                WorkerHandle {
                    tx,
                    application: app.clone(),
                },
            );
        }

        joins.push(spawn_notification_logger(self.notifier.subscribe()));

        info!(
            applications = workers.len(),
            clusters = self.clusters.servers().len(),
            "Controller started"
        );

        Ok(ControllerHandle {
            inner: Arc::new(ControllerInner {
                workers,
                joins: Mutex::new(joins),
                history: self.history,
                notifier: self.notifier,
            }),
        })
    }

    /// Run one pass for every application, wait for all of them and stop.
    ///
    /// Returns the recorded results in application order.
    pub async fn run_once(self) -> Result<Vec<SyncResult>, DaemonError> {
        let mut notifications = self.notifier.subscribe();
        let names: Vec<String> = self
            .config
            .applications
            .iter()
            .map(|app| app.name.clone())
            .collect();

        let history = self.history.clone();
        let baseline: BTreeMap<String, usize> = names
            .iter()
            .map(|name| (name.clone(), history.count(name)))
            .collect();

        let handle = self.with_initial_pass(true).start()?;

        let mut remaining: BTreeSet<String> = names.iter().cloned().collect();
        while !remaining.is_empty() {
            match notifications.recv().await {
                Ok(Notification::PassCompleted { application, .. }) => {
                    remaining.remove(&application);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Skipped completions are still in history
                    drop_recorded(&history, &baseline, &mut remaining);
                    warn!(skipped, outstanding = remaining.len(), "Notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        let mut results = Vec::new();
        for name in &names {
            if let Some(result) = handle.latest(name)? {
                results.push(result);
            }
        }
        handle.shutdown().await;
        Ok(results)
    }
}

/// Remove applications whose history grew past `baseline`
fn drop_recorded(history: &HistoryStore, baseline: &BTreeMap<String, usize>, remaining: &mut BTreeSet<String>) {
    remaining.retain(|name| history.count(name) <= baseline.get(name).copied().unwrap_or(0));
}

struct ControllerInner {
    workers: BTreeMap<String, WorkerHandle>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    history: HistoryStore,
    notifier: Notifier,
}

/// Cloneable handle to running workers
#[derive(Clone)]
pub struct ControllerHandle {
    inner: Arc<ControllerInner>,
}

impl ControllerHandle {
    /// Names of all managed applications, sorted
    pub fn applications(&self) -> Vec<String> {
        self.inner.workers.keys().cloned().collect()
    }

    pub fn application(&self, name: &str) -> Option<Application> {
        self.inner
            .workers
            .get(name)
            .map(|handle| handle.application.clone())
    }

    pub fn notifier(&self) -> Notifier {
        self.inner.notifier.clone()
    }

    async fn send(&self, name: &str, msg: WorkerMessage) -> Result<(), DaemonError> {
        let handle = self
            .inner
            .workers
            .get(name)
            .ok_or_else(|| DaemonError::ApplicationNotFound(name.to_string()))?;
        handle
            .tx
            .send(msg)
            .await
            .map_err(|e| DaemonError::Channel(format!("worker {} unavailable: {}", name, e)))
    }

    pub async fn poll(&self, name: &str) -> Result<(), DaemonError> {
        self.send(name, WorkerMessage::Poll).await
    }

    /// Refresh one application; `revision` is the pushed commit, if known
    pub async fn refresh(&self, name: &str, revision: Option<String>) -> Result<(), DaemonError> {
        self.send(name, WorkerMessage::Refresh { revision }).await
    }

    pub async fn sync(&self, name: &str) -> Result<(), DaemonError> {
        self.send(name, WorkerMessage::Sync).await
    }

    pub async fn drift_check(&self, name: &str) -> Result<(), DaemonError> {
        self.send(name, WorkerMessage::DriftCheck).await
    }

    /// Refresh every application sourced from any of `repo_urls`.
    ///
    /// A push usually names one repository several ways (clone, web, SSH);
    /// each matching application is refreshed once. With `git_ref` set, only
    /// applications tracking that ref are refreshed. Returns the names of the
    /// refreshed applications.
    pub async fn refresh_repo(
        &self,
        repo_urls: &[&str],
        git_ref: Option<&str>,
        revision: Option<String>,
    ) -> Vec<String> {
        let mut refreshed = Vec::new();
        for (name, handle) in &self.inner.workers {
            let app = &handle.application;
            if !repo_urls.iter().any(|url| app.repo_matches(url)) {
                continue;
            }
            if let Some(git_ref) = git_ref {
                if !app.tracks_ref(git_ref) {
                    debug!(app = %name, git_ref = %git_ref, "Push does not touch tracked revision");
                    continue;
                }
            }
            match self.refresh(name, revision.clone()).await {
                Ok(()) => refreshed.push(name.clone()),
                Err(e) => warn!(app = %name, error = %e, "Failed to queue refresh"),
            }
        }
        refreshed
    }

    pub async fn status(&self, name: &str) -> Result<WorkerStatus, DaemonError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(name, WorkerMessage::Status { response_tx }).await?;
        response_rx
            .await
            .map_err(|_| DaemonError::Channel(format!("worker {} dropped status request", name)))
    }

    pub fn latest(&self, name: &str) -> Result<Option<SyncResult>, DaemonError> {
        self.ensure_known(name)?;
        Ok(self.inner.history.latest(name)?)
    }

    /// Recorded results, newest first
    pub fn history(&self, name: &str, limit: usize) -> Result<Vec<SyncResult>, DaemonError> {
        self.ensure_known(name)?;
        Ok(self.inner.history.history(name, limit)?)
    }

    fn ensure_known(&self, name: &str) -> Result<(), DaemonError> {
        if self.inner.workers.contains_key(name) {
            Ok(())
        } else {
            Err(DaemonError::ApplicationNotFound(name.to_string()))
        }
    }

    /// Stop every worker and wait for in-flight passes to be recorded
    pub async fn shutdown(&self) {
        for (name, handle) in &self.inner.workers {
            if handle.tx.send(WorkerMessage::Shutdown).await.is_err() {
                debug!(app = %name, "Worker already stopped");
            }
        }

        let mut joins = {
            let mut joins = self
                .inner
                .joins
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *joins)
        };
        // The notification logger is last; it never ends on its own
        let logger = joins.pop();
        for join in joins {
            let _ = join.await;
        }
        if let Some(logger) = logger {
            logger.abort();
        }

        if let Err(e) = self.inner.history.flush() {
            warn!(error = %e, "Failed to flush history");
        }
        info!("Controller stopped");
    }
}

/// Log every notification at debug level
fn spawn_notification_logger(mut rx: broadcast::Receiver<Notification>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    debug!(
                        kind = notification.notification_type(),
                        app = %notification.application(),
                        "Notification"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Notification logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use librudder_core::PassTrigger;

    #[test]
    fn test_drop_recorded_uses_baseline() {
        let history = HistoryStore::temporary().unwrap();
        history
            .record(&SyncResult::new("old", PassTrigger::Poll, Utc::now()))
            .unwrap();

        let names = ["old", "done", "waiting"];
        let baseline: BTreeMap<String, usize> = names
            .iter()
            .map(|name| (name.to_string(), history.count(name)))
            .collect();
        history
            .record(&SyncResult::new("done", PassTrigger::Poll, Utc::now()))
            .unwrap();

        let mut remaining: BTreeSet<String> = names.iter().map(|name| name.to_string()).collect();
        drop_recorded(&history, &baseline, &mut remaining);

        assert_eq!(
            remaining.into_iter().collect::<Vec<_>>(),
            vec!["old".to_string(), "waiting".to_string()]
        );
    }
}
