//! Shared fixtures: an in-memory source, a memory cluster and a running controller

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use librudder_core::types::{ApplicationSource, Destination};
use librudder_core::{
    Application, ApplicationState, ControllerConfig, HistoryStore, ResourceId, ResourceKind,
    RetrySettings, SourceTree, SyncPolicy, SyncStatus, TemplateRenderer,
};
use librudder_git::GitError;
use rudder_daemon::{ClusterPool, ControllerHandle, MemoryCluster, Notification, SourceFetcher, Supervisor};
use serde_json::json;
use tokio::sync::broadcast;

pub const SERVER: &str = "https://cluster.test";
pub const NAMESPACE: &str = "apps";
pub const REPO: &str = "https://git.example.com/org/web.git";

const WAIT: Duration = Duration::from_secs(10);

/// Source whose tree is swapped by the test
pub struct StaticSource {
    tree: Mutex<SourceTree>,
}

impl StaticSource {
    pub fn new(tree: SourceTree) -> Self {
        Self {
            tree: Mutex::new(tree),
        }
    }

    pub fn set(&self, tree: SourceTree) {
        *self.tree.lock().unwrap() = tree;
    }
}

#[async_trait]
impl SourceFetcher for StaticSource {
    async fn fetch(&self, _source: &ApplicationSource) -> Result<SourceTree, GitError> {
        Ok(self.tree.lock().unwrap().clone())
    }
}

/// Fails with queued errors, then serves the wrapped source
pub struct FlakySource {
    inner: Arc<StaticSource>,
    failures: Mutex<VecDeque<GitError>>,
    fetches: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: Arc<StaticSource>, failures: Vec<GitError>) -> Self {
        Self {
            inner,
            failures: Mutex::new(failures.into()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Fetch calls seen so far, failed ones included
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FlakySource {
    async fn fetch(&self, source: &ApplicationSource) -> Result<SourceTree, GitError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(err) => Err(err),
            None => self.inner.fetch(source).await,
        }
    }
}

pub fn fetch_failure() -> GitError {
    GitError::Fetch {
        url: REPO.to_string(),
        message: "connection reset".to_string(),
    }
}

/// ConfigMap plus a Deployment referencing it
pub fn web_tree(commit: &str, greeting: &str) -> SourceTree {
    SourceTree::new(commit)
        .with_file("values.yaml", format!("greeting: {}\nreplicas: 2\n", greeting))
        .with_file(
            "config.yaml",
            r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: web-config
data:
  greeting: "{{ .Values.greeting }}"
"#,
        )
        .with_file(
            "deployment.yaml",
            r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: {{ .Values.replicas }}
  template:
    spec:
      containers:
        - name: web
          image: nginx:1.27
          envFrom:
            - configMapRef:
                name: web-config
"#,
        )
}

pub fn config_map_id() -> ResourceId {
    ResourceId::new(ResourceKind::ConfigMap, Some(NAMESPACE), "web-config")
}

pub fn deployment_id() -> ResourceId {
    ResourceId::new(ResourceKind::Deployment, Some(NAMESPACE), "web")
}

pub fn application(name: &str, sync_policy: SyncPolicy) -> Application {
    Application {
        name: name.to_string(),
        source: ApplicationSource {
            repo_url: REPO.to_string(),
            target_revision: "main".to_string(),
            path: String::new(),
            include: None,
            values_file: None,
            values: Default::default(),
        },
        destination: Destination {
            server: SERVER.to_string(),
            namespace: NAMESPACE.to_string(),
        },
        sync_policy,
    }
}

pub fn automated() -> SyncPolicy {
    SyncPolicy {
        automated: true,
        prune: true,
        self_heal: false,
    }
}

pub fn controller_config(applications: Vec<Application>) -> ControllerConfig {
    let mut config: ControllerConfig = serde_json::from_value(json!({})).unwrap();
    config.applications = applications;
    // Timers stay out of the way; tests trigger passes explicitly
    config.poll_interval_secs = 3600;
    config.drift_check_interval_secs = 3600;
    config.retry = RetrySettings {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
    };
    config
}

pub struct Harness {
    pub controller: ControllerHandle,
    pub cluster: Arc<MemoryCluster>,
    pub source: Arc<StaticSource>,
    pub history: HistoryStore,
    pub events: broadcast::Receiver<Notification>,
}

impl Harness {
    /// Start a controller without initial passes
    pub fn start(applications: Vec<Application>, tree: SourceTree) -> Self {
        Self::start_with(applications, tree, Arc::new(MemoryCluster::new()))
    }

    pub fn start_with(applications: Vec<Application>, tree: SourceTree, cluster: Arc<MemoryCluster>) -> Self {
        let source = Arc::new(StaticSource::new(tree));
        Self::launch(applications, source.clone(), source, cluster)
    }

    /// Start a controller whose source fails with `failures` before serving `tree`
    pub fn start_flaky(
        applications: Vec<Application>,
        tree: SourceTree,
        failures: Vec<GitError>,
    ) -> (Self, Arc<FlakySource>) {
        let source = Arc::new(StaticSource::new(tree));
        let flaky = Arc::new(FlakySource::new(source.clone(), failures));
        let harness = Self::launch(applications, flaky.clone(), source, Arc::new(MemoryCluster::new()));
        (harness, flaky)
    }

    fn launch(
        applications: Vec<Application>,
        fetcher: Arc<dyn SourceFetcher>,
        source: Arc<StaticSource>,
        cluster: Arc<MemoryCluster>,
    ) -> Self {
        let config = controller_config(applications);
        let history = HistoryStore::temporary().unwrap();

        let mut clusters = ClusterPool::new(config.cluster_api.clone());
        clusters.insert(SERVER, cluster.clone());

        let supervisor = Supervisor::new(
            config,
            fetcher,
            Arc::new(TemplateRenderer::new()),
            clusters,
            history.clone(),
        )
        .with_initial_pass(false);
        let events = supervisor.notifier().subscribe();
        let controller = supervisor.start().unwrap();

        Self {
            controller,
            cluster,
            source,
            history,
            events,
        }
    }

    /// Next completed pass for `app`: (status, superseded)
    pub async fn next_pass(&mut self, app: &str) -> (SyncStatus, bool) {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(Notification::PassCompleted {
                        application,
                        status,
                        superseded,
                        ..
                    }) if application == app => return (status, superseded),
                    Ok(_) => {}
                    Err(e) => panic!("notification stream failed: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for a pass")
    }

    pub async fn wait_for_state(&mut self, app: &str, state: ApplicationState) {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(Notification::StateChanged { application, to, .. })
                        if application == app && to == state =>
                    {
                        return
                    }
                    Ok(_) => {}
                    Err(e) => panic!("notification stream failed: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for state")
    }

    /// Next drift notification for `app`: (resources, self_heal)
    pub async fn next_drift(&mut self, app: &str) -> (Vec<String>, bool) {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(Notification::DriftDetected {
                        application,
                        resources,
                        self_heal,
                    }) if application == app => return (resources, self_heal),
                    Ok(_) => {}
                    Err(e) => panic!("notification stream failed: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for drift")
    }

    /// Assert no pass completes for `app` within `window`
    pub async fn assert_quiet(&mut self, app: &str, window: Duration) {
        let events = &mut self.events;
        let outcome = tokio::time::timeout(window, async {
            loop {
                match events.recv().await {
                    Ok(Notification::PassCompleted { application, .. }) if application == app => {
                        return application
                    }
                    Ok(_) => {}
                    Err(e) => panic!("notification stream failed: {}", e),
                }
            }
        })
        .await;
        assert!(outcome.is_err(), "unexpected pass for {}", app);
    }
}
