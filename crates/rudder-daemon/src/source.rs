//! Source fetching seam between workers and the Git poller

use std::sync::Arc;

use async_trait::async_trait;
use librudder_core::types::{ApplicationSource, SourceTree};
use librudder_git::{GitError, GitPoller};

/// Produces the file tree an application renders from
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &ApplicationSource) -> Result<SourceTree, GitError>;
}

/// Git-backed fetcher; polls run on the blocking pool
pub struct GitSource {
    poller: Arc<GitPoller>,
}

impl GitSource {
    pub fn new(poller: GitPoller) -> Self {
        Self {
            poller: Arc::new(poller),
        }
    }
}

#[async_trait]
impl SourceFetcher for GitSource {
    async fn fetch(&self, source: &ApplicationSource) -> Result<SourceTree, GitError> {
        let poller = self.poller.clone();
        let source = source.clone();
        tokio::task::spawn_blocking(move || poller.poll_source(&source))
            .await
            .map_err(|e| GitError::Io(std::io::Error::other(format!("poll task failed: {}", e))))?
    }
}
