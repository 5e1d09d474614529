//! Shared cluster client pool
//!
//! One client per destination server. Every client draws from a single
//! in-flight semaphore, and each server enforces a minimum spacing between
//! requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use librudder_core::config::ClusterApiSettings;
use librudder_core::{ClusterBackend, ControllerConfig, ResourceDescriptor, ResourceId};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::info;

use super::{ClusterApi, ClusterError, DirectoryCluster, MemoryCluster};
use crate::error::DaemonError;

/// Rate-limited wrapper around a cluster backend
pub struct RateLimitedClient {
    inner: Arc<dyn ClusterApi>,
    permits: Arc<Semaphore>,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimitedClient {
    pub fn new(inner: Arc<dyn ClusterApi>, permits: Arc<Semaphore>, min_interval: Duration) -> Self {
        Self {
            inner,
            permits,
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Wait out the spacing window, then take a permit
    async fn admit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, ClusterError> {
        if !self.min_interval.is_zero() {
            let mut last = self.last_request.lock().await;
            if let Some(previous) = *last {
                let ready_at = previous + self.min_interval;
                if ready_at > Instant::now() {
                    tokio::time::sleep_until(ready_at).await;
                }
            }
            *last = Some(Instant::now());
        }

        self.permits
            .acquire()
            .await
            .map_err(|_| ClusterError::Unavailable("cluster client pool closed".to_string()))
    }
}

#[async_trait]
impl ClusterApi for RateLimitedClient {
    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, ClusterError> {
        let _permit = self.admit().await?;
        self.inner.get(id).await
    }

    async fn list(&self, owner: &str) -> Result<Vec<ResourceDescriptor>, ClusterError> {
        let _permit = self.admit().await?;
        self.inner.list(owner).await
    }

    async fn create(&self, owner: &str, resource: &ResourceDescriptor) -> Result<String, ClusterError> {
        let _permit = self.admit().await?;
        self.inner.create(owner, resource).await
    }

    async fn update(
        &self,
        owner: &str,
        resource: &ResourceDescriptor,
        expected_version: Option<&str>,
    ) -> Result<String, ClusterError> {
        let _permit = self.admit().await?;
        self.inner.update(owner, resource, expected_version).await
    }

    async fn delete(&self, id: &ResourceId, expected_version: Option<&str>) -> Result<(), ClusterError> {
        let _permit = self.admit().await?;
        self.inner.delete(id, expected_version).await
    }
}

/// Cluster clients keyed by destination server
pub struct ClusterPool {
    settings: ClusterApiSettings,
    permits: Arc<Semaphore>,
    clients: HashMap<String, Arc<RateLimitedClient>>,
}

impl ClusterPool {
    pub fn new(settings: ClusterApiSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_in_flight));
        Self {
            settings,
            permits,
            clients: HashMap::new(),
        }
    }

    /// Build one backend per configured cluster
    pub fn from_config(config: &ControllerConfig) -> Result<Self, DaemonError> {
        let mut pool = Self::new(config.cluster_api.clone());
        for cluster in &config.clusters {
            let backend: Arc<dyn ClusterApi> = match cluster.backend {
                ClusterBackend::Memory => Arc::new(MemoryCluster::new()),
                ClusterBackend::Directory => {
                    let root = cluster
                        .root
                        .clone()
                        .ok_or_else(|| DaemonError::ClusterNotFound(cluster.server.clone()))?;
                    Arc::new(DirectoryCluster::new(root))
                }
            };
            info!(server = %cluster.server, backend = ?cluster.backend, "Registered cluster");
            pool.insert(&cluster.server, backend);
        }
        Ok(pool)
    }

    /// Register (or replace) the backend for `server`
    pub fn insert(&mut self, server: &str, backend: Arc<dyn ClusterApi>) {
        let client = RateLimitedClient::new(
            backend,
            self.permits.clone(),
            Duration::from_millis(self.settings.min_interval_ms),
        );
        self.clients.insert(server.to_string(), Arc::new(client));
    }

    pub fn get(&self, server: &str) -> Option<Arc<dyn ClusterApi>> {
        self.clients
            .get(server)
            .map(|client| client.clone() as Arc<dyn ClusterApi>)
    }

    pub fn servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self.clients.keys().cloned().collect();
        servers.sort();
        servers
    }
}
