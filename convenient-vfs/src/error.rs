//! Error types for the virtual file system.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for VFS operations.
pub type Result<T> = std::result::Result<T, VfsError>;

/// Errors raised while snapshotting or watching the file system.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Reading a path or its metadata failed.
    #[error("Could not read '{path}'")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// An include or exclude pattern did not parse.
    #[error("Invalid file pattern '{pattern}'")]
    InvalidPattern {
        /// Pattern as given.
        pattern: String,
        /// Parser failure.
        #[source]
        source: glob::PatternError,
    },

    /// Snapshots are keyed by absolute path only.
    #[error("Path '{0}' is not absolute")]
    RelativePath(PathBuf),

    /// The OS watcher could not be started or extended.
    #[error("File watching failed")]
    Watch(#[from] notify::Error),
}

impl VfsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
