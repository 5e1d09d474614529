//! Git source polling for rudder
//!
//! - Bare mirror cache per repository URL
//! - Branch, tag, commit and `HEAD` resolution
//! - Source tree reads rooted at an application path

mod error;
mod poller;

pub use error::GitError;
pub use poller::{fetch, open_mirror, read_tree, resolve, GitPoller, MIRROR_REFSPECS};
