//! Watcher error types.

use std::path::PathBuf;

use super::SessionId;

/// Errors that can occur while watching log files.
#[derive(thiserror::Error, Debug)]
pub enum WatcherError {
    /// Path did not exist when watching was requested.
    #[error("Log file not found: {0}")]
    PathNotFound(PathBuf),

    /// File could not be opened or read this cycle.
    #[error("Log file unavailable: {path}: {source}")]
    IoUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No session is registered under this id.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session task has already exited.
    #[error("Session closed: {0}")]
    SessionClosed(SessionId),
}

impl WatcherError {
    /// Wrap an I/O error for `path` as [`WatcherError::IoUnavailable`].
    pub(crate) fn unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoUnavailable {
            path: path.into(),
            source,
        }
    }
}

/// Error type returned by user-supplied reactions.
pub type ReactionError = Box<dyn std::error::Error + Send + Sync + 'static>;
