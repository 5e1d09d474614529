//! rudder reconciliation controller
//!
//! - One worker task per application running the poll/diff/sync loop
//! - Phase-ordered sync executor with bounded concurrency and retries
//! - Cluster API seam with memory and directory backends
//! - HTTP API for push webhooks and result queries

pub mod cluster;
pub mod error;
pub mod executor;
pub mod notifications;
pub mod retry;
pub mod server;
pub mod source;
pub mod supervisor;
pub mod worker;

pub use cluster::{ClusterApi, ClusterError, ClusterPool, DirectoryCluster, Fault, MemoryCluster};
pub use error::DaemonError;
pub use executor::{ExecutionReport, StaleFlag, SyncExecutor};
pub use notifications::{Notification, Notifier};
pub use retry::{retry_with_backoff, RetryConfig};
pub use source::{GitSource, SourceFetcher};
pub use supervisor::{ControllerHandle, Supervisor};
pub use worker::{WorkerMessage, WorkerStatus};
