//! Error types for storaged-sync.

use std::path::PathBuf;

use thiserror::Error;

use storaged_core::CoreError;

/// All errors that can arise while listing upstream state or applying a pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An upstream source could not be listed or queried.
    #[error("upstream {origin} failed: {message}")]
    Upstream { origin: String, message: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An error from the remembered-config store.
    #[error("config store error: {0}")]
    Store(#[from] CoreError),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
