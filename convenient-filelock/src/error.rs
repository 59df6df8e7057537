//! Error types for file locking.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, FileLockError>;

/// Errors raised by the lock manager and the locks it hands out.
#[derive(Debug, Error)]
pub enum FileLockError {
    /// The target is already locked by this process.
    #[error("Cannot lock {0} as it has already been locked by this process.")]
    AlreadyLocked(String),

    /// The lock was used after it was closed.
    #[error("This lock has been closed.")]
    Closed,

    /// The previous owner did not finish its last write.
    #[error("The file '{0}' was not unlocked cleanly")]
    IntegrityViolation(PathBuf),

    /// A write was attempted while holding a shared lock.
    #[error("An exclusive lock is required for this operation")]
    InsufficientLockMode,

    /// The lock could not be acquired in time.
    #[error("{message}")]
    Timeout {
        /// Human readable description of both parties.
        message: String,
        /// Lock file that could not be locked.
        lock_file: PathBuf,
    },

    /// The lock file was written by an incompatible version.
    #[error("Unexpected lock protocol found in lock file. Expected {expected}, found {found}.")]
    UnexpectedProtocol {
        /// Version this process writes.
        expected: u8,
        /// Version found on disk.
        found: u8,
    },

    /// Cache access was closed while still in use.
    #[error("Cannot close cache access for {name} as it is currently in use for {count} operations.")]
    CacheInUse {
        /// Display name of the cache.
        name: String,
        /// Operations still holding the lock.
        count: usize,
    },

    /// Acquire and release calls did not pair up.
    #[error("Mismatched lock count.")]
    MismatchedLockCount,

    /// The action run under the lock failed.
    #[error("Action on {0} failed")]
    Action(String, #[source] Box<dyn std::error::Error + Send + Sync>),

    /// Reading or writing the lock file failed.
    #[error("Lock file I/O failed")]
    Io(#[from] io::Error),
}
