use thiserror::Error;

/// Errors that can occur while polling a Git source
#[derive(Debug, Error)]
pub enum GitError {
    /// Network or authentication failure talking to the remote; retryable
    #[error("fetch of {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("revision '{revision}' not found in {url}")]
    RevisionNotFound { url: String, revision: String },

    #[error("path '{path}' not found at {commit}")]
    PathNotFound { path: String, commit: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Only fetch failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, GitError::Fetch { .. })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GitError::Fetch { .. } => "fetch_error",
            GitError::RevisionNotFound { .. } => "revision_not_found",
            GitError::PathNotFound { .. } => "path_not_found",
            GitError::Git(_) => "git_error",
            GitError::Io(_) => "io_error",
        }
    }

    /// Classify an error raised while talking to a remote
    pub(crate) fn from_fetch(url: &str, err: git2::Error) -> Self {
        use git2::{ErrorClass, ErrorCode};

        let transport = matches!(
            err.class(),
            ErrorClass::Net
                | ErrorClass::Ssh
                | ErrorClass::Http
                | ErrorClass::Ssl
                | ErrorClass::Os
                | ErrorClass::Callback
        );
        let auth = matches!(err.code(), ErrorCode::Auth | ErrorCode::Certificate);
        if transport || auth {
            GitError::Fetch {
                url: url.to_string(),
                message: err.message().to_string(),
            }
        } else {
            GitError::Git(err)
        }
    }
}
