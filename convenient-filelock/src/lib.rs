//! Cross-process file locking for shared build caches.
//!
//! Every locked target gets a `<name>.lock` file with two regions:
//!
//! - the **state region** records a sequence number and a dirty flag, and is
//!   locked (shared or exclusive) for as long as the lock is held
//! - the **information region** holds the owner's process id, operation,
//!   lock id and contention port, and is locked only while being read or
//!   written
//!
//! Writes through a [`FileLock`] mark the state dirty first and clean after,
//! so a process that dies mid-write is detected by the next owner. A process
//! waiting for a lock pings the owner's [`FileLockContentionHandler`], which
//! lets owners that only keep the lock for convenience
//! ([`LockOnDemandCacheAccess`]) hand it over early.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use convenient_filelock::{
//!     DEFAULT_LOCK_TIMEOUT, DefaultFileLockContentionHandler, DefaultProcessMetaDataProvider,
//!     FileLockManager, LockMode, LockOptions,
//! };
//!
//! let manager = FileLockManager::new(
//!     Arc::new(DefaultProcessMetaDataProvider),
//!     DEFAULT_LOCK_TIMEOUT,
//!     Arc::new(DefaultFileLockContentionHandler::new()),
//! );
//! let mut lock = manager.lock(
//!     "/work/.convenient/history".as_ref(),
//!     LockOptions::mode(LockMode::Exclusive),
//!     "execution history",
//!     "build",
//!     None,
//! )?;
//! lock.write_file(|| std::fs::write("/work/.convenient/history/entries.json", "{}"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

mod access;
mod backoff;
mod contention;
mod error;
mod info;
mod manager;
mod on_demand;
mod state;

pub use backoff::{AwaitableFileLockReleasedSignal, ExponentialBackoff, IoQuery};
pub use contention::{
    ContendedAction, DefaultFileLockContentionHandler, FileLockContentionHandler,
    FileLockReleasedSignal, NoOpContentionHandler,
};
pub use error::{FileLockError, Result};
pub use info::LockInfo;
pub use manager::{
    BoxError, DEFAULT_LOCK_TIMEOUT, DefaultProcessMetaDataProvider, FileLock, FileLockManager,
    IdGenerator, LockMode, LockOptions, ProcessMetaDataProvider, RandomIdGenerator, lock_file_for,
};
pub use on_demand::{
    CacheInitializationAction, FileLockGuard, LockHook, LockOnDemandCacheAccess,
};
pub use state::{
    DefaultLockStateSerializer, LockState, LockStateSerializer, Version1LockStateSerializer,
};
