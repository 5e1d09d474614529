//! Core library for rudder
//!
//! - Resource model with a fixed dependency phase table
//! - Desired-state differ producing ordered sync operations
//! - Manifest renderer trait and the built-in template renderer
//! - Content-addressed revision snapshots
//! - Controller configuration and sync result history

pub mod config;
pub mod diff;
pub mod error;
pub mod hash;
pub mod render;
pub mod store;
pub mod types;

pub use config::{load_config, save_config, ClusterBackend, ClusterConfig, ControllerConfig, RetrySettings};
pub use diff::{diff, DiffResult};
pub use error::CoreError;
pub use render::{ManifestRenderer, TemplateRenderer};
pub use store::{HistoryStore, LockedHistoryStore};
pub use types::{
    Application, ApplicationState, OperationKind, OperationState, PassTrigger, ResourceDescriptor,
    ResourceId, ResourceKind, RevisionSnapshot, SourceTree, SyncOperation, SyncPhase, SyncPolicy,
    SyncResult, SyncStatus,
};
