use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::application::Application;

/// Controller configuration, usually `rudder.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Sync result history and the controller lock live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Git mirror cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_drift_check_interval_secs")]
    pub drift_check_interval_secs: u64,
    /// Upper bound on concurrent operations within one phase
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,
    /// HTTP listen address for webhooks and queries
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub cluster_api: ClusterApiSettings,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub applications: Vec<Application>,
}

/// Backoff policy for transient failures (Git fetch, cluster API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Limits shared by every application talking to the cluster API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterApiSettings {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Minimum spacing between requests to one server (0 = none)
    #[serde(default)]
    pub min_interval_ms: u64,
}

impl Default for ClusterApiSettings {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            min_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBackend {
    Memory,
    Directory,
}

/// A destination cluster, referenced by `destination.server`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub server: String,
    pub backend: ClusterBackend,
    /// Root directory for the directory backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".rudder/data")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".rudder/cache")
}

fn default_poll_interval_secs() -> u64 {
    180
}

fn default_drift_check_interval_secs() -> u64 {
    30
}

fn default_max_concurrent_ops() -> usize {
    8
}

fn default_listen() -> String {
    "127.0.0.1:8085".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_in_flight() -> usize {
    32
}

impl ControllerConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.poll_interval_secs == 0 {
            return Err(CoreError::InvalidConfig("poll_interval_secs must be > 0".to_string()));
        }
        if self.drift_check_interval_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "drift_check_interval_secs must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_ops == 0 {
            return Err(CoreError::InvalidConfig("max_concurrent_ops must be > 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::InvalidConfig("retry.max_attempts must be > 0".to_string()));
        }
        if self.cluster_api.max_in_flight == 0 {
            return Err(CoreError::InvalidConfig(
                "cluster_api.max_in_flight must be > 0".to_string(),
            ));
        }

        let mut servers = HashSet::new();
        for cluster in &self.clusters {
            if !servers.insert(cluster.server.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate cluster '{}'",
                    cluster.server
                )));
            }
            if cluster.backend == ClusterBackend::Directory && cluster.root.is_none() {
                return Err(CoreError::InvalidConfig(format!(
                    "cluster '{}' uses the directory backend without 'root'",
                    cluster.server
                )));
            }
        }

        let mut names = HashSet::new();
        for app in &self.applications {
            if app.name.trim().is_empty() {
                return Err(CoreError::InvalidConfig("application with empty name".to_string()));
            }
            if !names.insert(app.name.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate application '{}'",
                    app.name
                )));
            }
            if app.source.repo_url.trim().is_empty() {
                return Err(CoreError::InvalidConfig(format!(
                    "application '{}' has no repo_url",
                    app.name
                )));
            }
            if !servers.contains(app.destination.server.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "application '{}' targets unknown cluster '{}'",
                    app.name, app.destination.server
                )));
            }
        }
        Ok(())
    }

    /// Find an application by name
    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.name == name)
    }
}

/// Load and validate a controller config
pub fn load_config(path: &Path) -> Result<ControllerConfig, CoreError> {
    if !path.exists() {
        return Err(CoreError::NotFound(format!(
            "Config not found: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let config: ControllerConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save a controller config
pub fn save_config(path: &Path, config: &ControllerConfig) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
