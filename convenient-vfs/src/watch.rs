//! OS file watching that keeps the cache valid between builds.

use crate::access::LocationsWrittenByCurrentBuild;
use crate::error::Result;
use crate::vfs::VirtualFileSystem;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Invalidates the virtual file system when watched locations change.
///
/// Changes to locations the running build wrote itself are ignored, they
/// were already invalidated by the write. When the watcher reports an error
/// or lost events, everything is dropped.
pub struct FileWatcher {
    vfs: Arc<VirtualFileSystem>,
    written: Arc<LocationsWrittenByCurrentBuild>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched: Mutex<BTreeSet<PathBuf>>,
}

impl FileWatcher {
    /// Watcher feeding `vfs`; not watching anything yet.
    #[must_use]
    pub fn new(vfs: Arc<VirtualFileSystem>, written: Arc<LocationsWrittenByCurrentBuild>) -> Self {
        Self {
            vfs,
            written,
            watcher: Mutex::new(None),
            watched: Mutex::new(BTreeSet::new()),
        }
    }

    /// Start recording build writes and watch `roots` recursively.
    ///
    /// # Errors
    ///
    /// Returns `VfsError::Watch` if the OS watcher cannot be created or a
    /// root cannot be watched. The cache is dropped in that case since
    /// changes may go unnoticed.
    pub fn after_build_started<I>(&self, roots: I) -> Result<()>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.written.build_started();
        let result = self.watch(roots);
        if result.is_err() {
            self.vfs.invalidate_all();
        }
        result
    }

    fn watch<I>(&self, roots: I) -> Result<()>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut guard = self.watcher.lock();
        if guard.is_none() {
            let vfs = Arc::clone(&self.vfs);
            let written = Arc::clone(&self.written);
            *guard = Some(notify::recommended_watcher(move |event: notify::Result<Event>| {
                handle_event(&vfs, &written, event);
            })?);
        }
        let Some(watcher) = guard.as_mut() else {
            return Ok(());
        };
        let mut watched = self.watched.lock();
        for root in roots {
            if watched.contains(&root) {
                continue;
            }
            watcher.watch(&root, RecursiveMode::Recursive)?;
            debug!(root = %root.display(), "Watching");
            let _ = watched.insert(root);
        }
        Ok(())
    }

    /// Stop recording build writes and log what the cache retains.
    pub fn before_build_finished(&self) {
        self.written.build_finished();
        let statistics = self.vfs.statistics();
        info!(
            files = statistics.files,
            directories = statistics.directories,
            missing = statistics.missing,
            "Virtual file system retains snapshots"
        );
    }

    /// Stop watching altogether.
    pub fn stop(&self) {
        *self.watcher.lock() = None;
        self.watched.lock().clear();
    }

    /// Roots currently watched.
    #[must_use]
    pub fn watched_roots(&self) -> Vec<PathBuf> {
        self.watched.lock().iter().cloned().collect()
    }
}

pub(crate) fn handle_event(
    vfs: &VirtualFileSystem,
    written: &LocationsWrittenByCurrentBuild,
    event: notify::Result<Event>,
) {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "File watching failed, dropping the virtual file system");
            vfs.invalidate_all();
            return;
        }
    };
    if event.need_rescan() {
        warn!("File watcher lost events, dropping the virtual file system");
        vfs.invalidate_all();
        return;
    }
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }
    let changed: Vec<_> = event
        .paths
        .into_iter()
        .filter(|path| !written.was_written(path))
        .collect();
    vfs.invalidate(changed);
}
