//! Error types for the download module.

use std::path::PathBuf;

use thiserror::Error;

use crate::request::RequestError;

/// Errors that can occur while downloading a file.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Building, sending or reading the request failed, or the server
    /// answered with an unexpected status.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// File system error while preparing, writing or finalizing the file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The download queue stopped before the attempt finished.
    #[error("download queue is closed")]
    QueueClosed,
}

// `Request` converts with `From` because a `RequestError` already names its
// URL. IO errors need the path, so they only go through `DownloadError::io`.
impl DownloadError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The HTTP status behind this error, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Request(e) => e.status_code(),
            _ => None,
        }
    }
}
