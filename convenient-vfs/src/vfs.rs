//! The current snapshot hierarchy behind an atomic reference.

use crate::hierarchy::{HierarchyStatistics, SnapshotHierarchy};
use crate::snapshot::Snapshot;
use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory cache of file system snapshots.
///
/// Readers load the current [`SnapshotHierarchy`] without locking. Updates
/// compute a new hierarchy from the current one and swap it in with a
/// compare-and-swap loop, so concurrent updates never lose each other and
/// readers never see a half-applied one.
pub struct VirtualFileSystem {
    root: ArcSwap<SnapshotHierarchy>,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    /// Empty file system cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: ArcSwap::from_pointee(SnapshotHierarchy::empty()),
        }
    }

    /// The hierarchy as of now.
    #[must_use]
    pub fn root(&self) -> Arc<SnapshotHierarchy> {
        self.root.load_full()
    }

    /// Cached snapshot for `path`.
    #[must_use]
    pub fn find_snapshot(&self, path: &Path) -> Option<Arc<Snapshot>> {
        self.root.load().find_snapshot(path)
    }

    /// Store a snapshot at its own path.
    pub fn store(&self, snapshot: Arc<Snapshot>) {
        self.update(|root| root.store(snapshot.path(), Arc::clone(&snapshot)));
    }

    /// Store a snapshot unless something was invalidated after
    /// `invalidations` was observed; a snapshot computed across an
    /// invalidation may describe the disk from before a write.
    ///
    /// Returns whether the snapshot was stored.
    pub fn store_if_unchanged(&self, invalidations: u64, snapshot: &Arc<Snapshot>) -> bool {
        let previous = self.root.rcu(|root| {
            if root.invalidations() == invalidations {
                root.store(snapshot.path(), Arc::clone(snapshot))
            } else {
                SnapshotHierarchy::clone(root)
            }
        });
        let stored = previous.invalidations() == invalidations;
        if !stored {
            debug!(path = %snapshot.path().display(), "Discarding snapshot computed across an invalidation");
        }
        stored
    }

    /// Invalidate `locations` and everything below them.
    pub fn invalidate<I>(&self, locations: I)
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        let locations: Vec<_> = locations
            .into_iter()
            .map(|l| l.as_ref().to_path_buf())
            .collect();
        if locations.is_empty() {
            return;
        }
        debug!(count = locations.len(), "Invalidating locations");
        self.update(|root| {
            locations
                .iter()
                .fold(SnapshotHierarchy::clone(root), |hierarchy, location| {
                    hierarchy.invalidate(location)
                })
        });
    }

    /// Drop every snapshot.
    pub fn invalidate_all(&self) {
        info!("Invalidating the whole virtual file system");
        self.update(SnapshotHierarchy::invalidate_all);
    }

    /// Counts of retained snapshots.
    #[must_use]
    pub fn statistics(&self) -> HierarchyStatistics {
        self.root.load().statistics()
    }

    fn update(&self, updater: impl Fn(&SnapshotHierarchy) -> SnapshotHierarchy) {
        let _ = self.root.rcu(|root| updater(root));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::AccessType;
    use tracing_test::traced_test;

    #[test]
    fn test_store_and_invalidate() {
        let vfs = VirtualFileSystem::new();
        let snapshot = Arc::new(Snapshot::missing("/tmp/none", AccessType::Direct));
        vfs.store(Arc::clone(&snapshot));

        let found = vfs.find_snapshot(Path::new("/tmp/none")).unwrap();
        assert!(Arc::ptr_eq(&found, &snapshot));

        vfs.invalidate(["/tmp"]);
        assert!(vfs.find_snapshot(Path::new("/tmp/none")).is_none());
    }

    #[test]
    #[traced_test]
    fn test_invalidation_is_logged() {
        let vfs = VirtualFileSystem::new();
        vfs.invalidate(Vec::<&str>::new());
        assert!(!logs_contain("Invalidating locations"));

        vfs.invalidate(["/a", "/b"]);
        assert!(logs_contain("Invalidating locations"));
        assert!(logs_contain("count=2"));

        vfs.invalidate_all();
        assert!(logs_contain("Invalidating the whole virtual file system"));
    }

    #[test]
    fn test_old_root_unchanged_by_update() {
        let vfs = VirtualFileSystem::new();
        vfs.store(Arc::new(Snapshot::missing("/a", AccessType::Direct)));
        let before = vfs.root();
        vfs.invalidate_all();
        assert!(before.find_snapshot(Path::new("/a")).is_some());
        assert!(vfs.root().is_empty());
    }

    #[test]
    fn test_store_if_unchanged_rejects_stale_snapshot() {
        let vfs = VirtualFileSystem::new();
        let observed = vfs.root().invalidations();
        vfs.invalidate(["/elsewhere"]);

        let snapshot = Arc::new(Snapshot::missing("/a", AccessType::Direct));
        assert!(!vfs.store_if_unchanged(observed, &snapshot));
        assert!(vfs.find_snapshot(Path::new("/a")).is_none());

        let current = vfs.root().invalidations();
        assert!(vfs.store_if_unchanged(current, &snapshot));
        assert!(vfs.find_snapshot(Path::new("/a")).is_some());
    }
}
