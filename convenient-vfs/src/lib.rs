//! Virtual file system for incremental builds.
//!
//! Hashing file trees is the most expensive thing an up-to-date check does,
//! so this crate keeps an in-memory cache of what it has seen on disk:
//!
//! - [`Snapshot`]: immutable record of a path's type and content hash
//! - [`SnapshotHierarchy`]: persistent tree from absolute path to snapshot,
//!   updated by copy-on-write
//! - [`VirtualFileSystem`]: holds the current hierarchy behind an atomically
//!   swapped reference
//! - [`FileSystemAccess`]: read/write front door that snapshots on a cache
//!   miss, guarding each path so it is computed by at most one thread
//! - [`FileWatcher`]: optional OS notifications that invalidate between
//!   builds
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use convenient_vfs::{DefaultFileHasher, FileSystemAccess, VirtualFileSystem};
//!
//! let vfs = Arc::new(VirtualFileSystem::new());
//! let access = FileSystemAccess::new(vfs, Arc::new(DefaultFileHasher));
//! let first = access.read("/work/src".as_ref())?;
//! let second = access.read("/work/src".as_ref())?;
//! assert!(Arc::ptr_eq(&first, &second));
//!
//! access.write(["/work/src/Main.java"], || std::fs::write("/work/src/Main.java", "class Main {}"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

mod access;
mod error;
mod filter;
mod guard;
mod hasher;
mod hierarchy;
mod snapshot;
mod snapshotter;
mod vfs;
mod watch;

pub use access::{FileSystemAccess, LocationsWrittenByCurrentBuild, WriteListener};
pub use error::{Result, VfsError};
pub use filter::SnapshottingFilter;
pub use guard::StripedProducerGuard;
pub use hasher::{DefaultFileHasher, FileHasher};
pub use hierarchy::{HierarchyStatistics, SnapshotHierarchy};
pub use snapshot::{AccessType, FileMetadata, FileType, HashCode, Snapshot, SnapshotKind};
pub use snapshotter::{DEFAULT_EXCLUDES, DirectorySnapshotter, DirectoryWalk};
pub use vfs::VirtualFileSystem;
pub use watch::FileWatcher;
