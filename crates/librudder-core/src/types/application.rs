use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default revision when none is configured
pub const DEFAULT_TARGET_REVISION: &str = "HEAD";

/// Branches a `HEAD` target follows on push
const DEFAULT_BRANCHES: [&str; 2] = ["main", "master"];

/// Declarative application: one Git source, one destination, one policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub source: ApplicationSource,
    pub destination: Destination,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSource {
    pub repo_url: String,
    #[serde(default = "default_target_revision")]
    pub target_revision: String,
    /// Directory inside the repository; "" or "." for the root
    #[serde(default)]
    pub path: String,
    /// Glob selecting manifest files relative to `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
    /// Values file relative to `path` (defaults to `values.yaml` when present)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_file: Option<String>,
    /// Inline values overlay, merged over the values file
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub values: Map<String, Value>,
}

fn default_target_revision() -> String {
    DEFAULT_TARGET_REVISION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Key into the cluster client pool
    pub server: String,
    /// Namespace for namespaced resources that do not set one
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Apply diffs automatically; manual applications only diff until asked to sync
    #[serde(default)]
    pub automated: bool,
    /// Delete live resources that left desired state
    #[serde(default)]
    pub prune: bool,
    /// Revert live drift without waiting for the next poll
    #[serde(default)]
    pub self_heal: bool,
}

impl Application {
    /// Whether a pushed repository URL refers to this application's source.
    ///
    /// Trailing slashes, a `.git` suffix and letter case are ignored.
    pub fn repo_matches(&self, url: &str) -> bool {
        normalize_repo_url(&self.source.repo_url) == normalize_repo_url(url)
    }

    /// Whether a pushed ref (e.g. `refs/heads/main`) feeds this application.
    ///
    /// A `HEAD` target only follows the default branch, taken to be `main`
    /// or `master` as when the poller resolves `HEAD`.
    pub fn tracks_ref(&self, git_ref: &str) -> bool {
        let target = self.source.target_revision.as_str();
        if target == DEFAULT_TARGET_REVISION {
            let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
            return git_ref == DEFAULT_TARGET_REVISION || DEFAULT_BRANCHES.contains(&branch);
        }
        let short = git_ref
            .strip_prefix("refs/heads/")
            .or_else(|| git_ref.strip_prefix("refs/tags/"))
            .unwrap_or(git_ref);
        short == target
    }
}

/// Normalize a repository URL for comparison
pub fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.to_lowercase()
}

/// Reconciliation state of one application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    Idle,
    Polling,
    Diffing,
    Syncing,
    Degraded,
}

impl ApplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationState::Idle => "idle",
            ApplicationState::Polling => "polling",
            ApplicationState::Diffing => "diffing",
            ApplicationState::Syncing => "syncing",
            ApplicationState::Degraded => "degraded",
        }
    }

    /// Idle and Degraded are the resting states between passes
    pub fn is_resting(&self) -> bool {
        matches!(self, ApplicationState::Idle | ApplicationState::Degraded)
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(repo: &str, revision: &str) -> Application {
        Application {
            name: "guestbook".to_string(),
            source: ApplicationSource {
                repo_url: repo.to_string(),
                target_revision: revision.to_string(),
                path: "deploy".to_string(),
                include: None,
                values_file: None,
                values: Map::new(),
            },
            destination: Destination {
                server: "local".to_string(),
                namespace: "default".to_string(),
            },
            sync_policy: SyncPolicy::default(),
        }
    }

    #[test]
    fn test_repo_matches_ignores_suffixes() {
        let a = app("https://github.com/acme/deploy.git", "main");
        assert!(a.repo_matches("https://github.com/acme/deploy"));
        assert!(a.repo_matches("https://github.com/Acme/deploy/"));
        assert!(!a.repo_matches("https://github.com/acme/other"));
    }

    #[test]
    fn test_tracks_ref() {
        let a = app("https://example.com/r.git", "main");
        assert!(a.tracks_ref("refs/heads/main"));
        assert!(!a.tracks_ref("refs/heads/dev"));

        let tag = app("https://example.com/r.git", "v1.2.0");
        assert!(tag.tracks_ref("refs/tags/v1.2.0"));
    }

    #[test]
    fn test_head_target_tracks_only_default_branch() {
        let head = app("https://example.com/r.git", "HEAD");
        assert!(head.tracks_ref("refs/heads/main"));
        assert!(head.tracks_ref("refs/heads/master"));
        assert!(head.tracks_ref("HEAD"));
        assert!(!head.tracks_ref("refs/heads/feature-x"));
        assert!(!head.tracks_ref("refs/heads/dev"));
        assert!(!head.tracks_ref("refs/tags/v1.2.0"));
    }

    #[test]
    fn test_policy_defaults_to_manual() {
        let policy = SyncPolicy::default();
        assert!(!policy.automated);
        assert!(!policy.prune);
        assert!(!policy.self_heal);
    }
}
