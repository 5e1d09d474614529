pub mod application;
pub mod operation;
pub mod resource;
pub mod result;
pub mod snapshot;

pub use application::{Application, ApplicationSource, ApplicationState, Destination, SyncPolicy};
pub use operation::{OperationError, OperationKind, OperationState, SyncOperation};
pub use resource::{ResourceDescriptor, ResourceId, ResourceKind, SyncPhase};
pub use result::{PassTrigger, SyncResult, SyncStatus};
pub use snapshot::{RevisionSnapshot, SourceTree};
