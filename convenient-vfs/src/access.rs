//! Reading and writing through the virtual file system.

use crate::error::{Result, VfsError};
use crate::filter::SnapshottingFilter;
use crate::guard::StripedProducerGuard;
use crate::hasher::{FileHasher, Stat, stat};
use crate::snapshot::{HashCode, Snapshot};
use crate::snapshotter::DirectorySnapshotter;
use crate::vfs::VirtualFileSystem;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Told about every location about to be written.
pub trait WriteListener: Send + Sync {
    /// `locations` are about to be modified.
    fn locations_written(&self, locations: &[PathBuf]);
}

/// Remembers locations written while a build runs, so file events caused by
/// the build itself can be told apart from outside changes.
#[derive(Debug, Default)]
pub struct LocationsWrittenByCurrentBuild {
    build_running: AtomicBool,
    locations: Mutex<Vec<PathBuf>>,
}

impl LocationsWrittenByCurrentBuild {
    /// Start recording.
    pub fn build_started(&self) {
        self.locations.lock().clear();
        self.build_running.store(true, Ordering::SeqCst);
    }

    /// Stop recording and forget what was recorded.
    pub fn build_finished(&self) {
        self.build_running.store(false, Ordering::SeqCst);
        self.locations.lock().clear();
    }

    /// Whether `location` or one of its ancestors was written by the running
    /// build.
    #[must_use]
    pub fn was_written(&self, location: &Path) -> bool {
        self.locations
            .lock()
            .iter()
            .any(|written| location.starts_with(written))
    }
}

impl WriteListener for LocationsWrittenByCurrentBuild {
    fn locations_written(&self, locations: &[PathBuf]) {
        if self.build_running.load(Ordering::SeqCst) {
            self.locations.lock().extend_from_slice(locations);
        }
    }
}

struct NoOpWriteListener;

impl WriteListener for NoOpWriteListener {
    fn locations_written(&self, _locations: &[PathBuf]) {}
}

/// Snapshotting front door of the virtual file system.
///
/// Reads are answered from the cache when possible. On a miss the location
/// is snapshotted under a per-path stripe lock; a thread that waited on the
/// stripe checks the cache again before touching the disk.
pub struct FileSystemAccess {
    vfs: Arc<VirtualFileSystem>,
    snapshotter: DirectorySnapshotter,
    producing: StripedProducerGuard,
    write_listener: Arc<dyn WriteListener>,
}

impl FileSystemAccess {
    /// Access backed by `vfs`, hashing files with `hasher`.
    #[must_use]
    pub fn new(vfs: Arc<VirtualFileSystem>, hasher: Arc<dyn FileHasher>) -> Self {
        Self {
            vfs,
            snapshotter: DirectorySnapshotter::new(hasher),
            producing: StripedProducerGuard::default(),
            write_listener: Arc::new(NoOpWriteListener),
        }
    }

    /// Notify `listener` before every write.
    #[must_use]
    pub fn with_write_listener(mut self, listener: Arc<dyn WriteListener>) -> Self {
        self.write_listener = listener;
        self
    }

    /// The underlying cache.
    #[must_use]
    pub fn virtual_file_system(&self) -> &Arc<VirtualFileSystem> {
        &self.vfs
    }

    /// Snapshot of `location`, from the cache if possible.
    ///
    /// A directory is walked completely and the whole tree is cached, so
    /// every descendant can be read without touching the disk again.
    ///
    /// # Errors
    ///
    /// Returns `VfsError::RelativePath` for a relative location and
    /// `VfsError::Io` if the location cannot be read.
    pub fn read(&self, location: &Path) -> Result<Arc<Snapshot>> {
        ensure_absolute(location)?;
        if let Some(snapshot) = self.vfs.find_snapshot(location) {
            return Ok(snapshot);
        }
        self.producing.guard_by_key(location, || {
            if let Some(snapshot) = self.vfs.find_snapshot(location) {
                return Ok(snapshot);
            }
            let invalidations = self.vfs.root().invalidations();
            let snapshot = match stat(location).map_err(|e| VfsError::io(location, e))? {
                Stat::Directory(access_type) => {
                    self.snapshotter
                        .snapshot_directory(location, access_type, None)?
                        .root
                }
                Stat::RegularFile(metadata, access_type) => {
                    self.snapshotter
                        .snapshot_file(location, metadata, access_type)?
                }
                Stat::Missing(access_type) => Arc::new(Snapshot::missing(location, access_type)),
            };
            let _ = self.vfs.store_if_unchanged(invalidations, &snapshot);
            Ok(snapshot)
        })
    }

    /// Snapshot of `location` with `filter` applied.
    ///
    /// A cached snapshot is filtered in memory; otherwise the walk itself
    /// applies the filter and caches the parts the filter did not touch.
    /// Returns `None` for a regular file the filter rejects.
    ///
    /// # Errors
    ///
    /// Same as [`FileSystemAccess::read`].
    pub fn read_filtered(
        &self,
        location: &Path,
        filter: &SnapshottingFilter,
    ) -> Result<Option<Arc<Snapshot>>> {
        if filter.is_empty() {
            return self.read(location).map(Some);
        }
        ensure_absolute(location)?;
        if let Some(snapshot) = self.vfs.find_snapshot(location) {
            return Ok(filter.filter_snapshot(&snapshot));
        }
        self.producing.guard_by_key(location, || {
            if let Some(snapshot) = self.vfs.find_snapshot(location) {
                return Ok(filter.filter_snapshot(&snapshot));
            }
            let invalidations = self.vfs.root().invalidations();
            match stat(location).map_err(|e| VfsError::io(location, e))? {
                Stat::Directory(access_type) => {
                    let walk =
                        self.snapshotter
                            .snapshot_directory(location, access_type, Some(filter))?;
                    for complete in &walk.complete {
                        if !self.vfs.store_if_unchanged(invalidations, complete) {
                            break;
                        }
                    }
                    Ok(Some(walk.root))
                }
                Stat::RegularFile(metadata, access_type) => {
                    let snapshot =
                        self.snapshotter
                            .snapshot_file(location, metadata, access_type)?;
                    let _ = self.vfs.store_if_unchanged(invalidations, &snapshot);
                    Ok(filter.filter_snapshot(&snapshot))
                }
                Stat::Missing(access_type) => {
                    let snapshot = Arc::new(Snapshot::missing(location, access_type));
                    let _ = self.vfs.store_if_unchanged(invalidations, &snapshot);
                    Ok(Some(snapshot))
                }
            }
        })
    }

    /// Content hash of `location` if it is a regular file.
    ///
    /// Unlike [`FileSystemAccess::read`] this never walks a directory.
    ///
    /// # Errors
    ///
    /// Same as [`FileSystemAccess::read`].
    pub fn read_regular_file_content_hash(&self, location: &Path) -> Result<Option<HashCode>> {
        ensure_absolute(location)?;
        if let Some(snapshot) = self.vfs.find_snapshot(location) {
            return Ok(snapshot.content_hash());
        }
        self.producing.guard_by_key(location, || {
            if let Some(snapshot) = self.vfs.find_snapshot(location) {
                return Ok(snapshot.content_hash());
            }
            let invalidations = self.vfs.root().invalidations();
            match stat(location).map_err(|e| VfsError::io(location, e))? {
                Stat::RegularFile(metadata, access_type) => {
                    let snapshot =
                        self.snapshotter
                            .snapshot_file(location, metadata, access_type)?;
                    let _ = self.vfs.store_if_unchanged(invalidations, &snapshot);
                    Ok(snapshot.content_hash())
                }
                Stat::Missing(access_type) => {
                    let snapshot = Arc::new(Snapshot::missing(location, access_type));
                    let _ = self.vfs.store_if_unchanged(invalidations, &snapshot);
                    Ok(None)
                }
                Stat::Directory(_) => Ok(None),
            }
        })
    }

    /// Run `action`, which modifies `locations`, after invalidating them.
    ///
    /// This is the only way locations known to the cache may be changed.
    pub fn write<I, T>(&self, locations: I, action: impl FnOnce() -> T) -> T
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        let locations: Vec<PathBuf> = locations
            .into_iter()
            .map(|l| l.as_ref().to_path_buf())
            .collect();
        self.write_listener.locations_written(&locations);
        self.vfs.invalidate(&locations);
        action()
    }

    /// Cache a snapshot produced elsewhere, e.g. outputs captured right
    /// after they were written.
    pub fn record(&self, snapshot: Arc<Snapshot>) {
        self.vfs.store(snapshot);
    }

    /// Replace the names every walk skips. Cached snapshots were taken with
    /// the old excludes, so everything is dropped.
    ///
    /// # Errors
    ///
    /// Returns `VfsError::InvalidPattern` for a pattern that does not parse.
    pub fn update_default_excludes<I>(&self, excludes: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.snapshotter.set_default_excludes(excludes)?;
        debug!("Default excludes changed");
        self.vfs.invalidate_all();
        Ok(())
    }
}

fn ensure_absolute(location: &Path) -> Result<()> {
    if location.is_absolute() {
        Ok(())
    } else {
        Err(VfsError::RelativePath(location.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::DefaultFileHasher;
    use std::fs;
    use tempfile::TempDir;

    fn access() -> FileSystemAccess {
        FileSystemAccess::new(Arc::new(VirtualFileSystem::new()), Arc::new(DefaultFileHasher))
    }

    #[test]
    fn test_relative_path_is_rejected() {
        assert!(matches!(
            access().read(Path::new("relative/path")),
            Err(VfsError::RelativePath(_))
        ));
    }

    #[test]
    fn test_missing_location() {
        let dir = TempDir::new().unwrap();
        let access = access();
        let missing = dir.path().join("nothing");
        let snapshot = access.read(&missing).unwrap();
        assert_eq!(snapshot.file_type(), crate::snapshot::FileType::Missing);
        assert_eq!(access.read_regular_file_content_hash(&missing).unwrap(), None);
    }

    #[test]
    fn test_directory_read_caches_descendants() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.txt"), "a").unwrap();
        let access = access();

        let root = access.read(dir.path()).unwrap();
        let child = access.read(&dir.path().join("src/a.txt")).unwrap();
        assert!(Arc::ptr_eq(&child, &root.children()[0].children()[0]));
        assert_eq!(
            access
                .read_regular_file_content_hash(&dir.path().join("src/a.txt"))
                .unwrap(),
            Some(HashCode::of_bytes(b"a"))
        );
    }

    #[test]
    fn test_write_listener_records_during_build_only() {
        let written = Arc::new(LocationsWrittenByCurrentBuild::default());
        let access = access().with_write_listener(written.clone());

        access.write(["/out/before"], || ());
        written.build_started();
        access.write(["/out/classes"], || ());

        assert!(!written.was_written(Path::new("/out/before")));
        assert!(written.was_written(Path::new("/out/classes/Main.class")));
        written.build_finished();
        assert!(!written.was_written(Path::new("/out/classes")));
    }

    #[test]
    fn test_record_stores_external_snapshot() {
        let access = access();
        let snapshot = Arc::new(Snapshot::missing("/recorded", crate::snapshot::AccessType::Direct));
        access.record(Arc::clone(&snapshot));
        assert!(Arc::ptr_eq(&access.read(Path::new("/recorded")).unwrap(), &snapshot));
    }
}
