//! Directory walking and snapshot construction.

use crate::error::{Result, VfsError};
use crate::filter::{SnapshottingFilter, matches};
use crate::hasher::FileHasher;
use crate::snapshot::{AccessType, FileMetadata, Snapshot};
use glob::Pattern;
use parking_lot::RwLock;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

/// Names skipped by every walk: version control and OS metadata.
pub const DEFAULT_EXCLUDES: &[&str] = &[".git", ".svn", ".hg", "CVS", ".bzr", ".DS_Store"];

/// Result of walking a directory.
#[derive(Debug, Clone)]
pub struct DirectoryWalk {
    /// Snapshot of the walked root with the filtered tree below it.
    pub root: Arc<Snapshot>,
    /// Whether the filter dropped anything, i.e. `root` is incomplete.
    pub filtered: bool,
    /// Largest subtrees that were not affected by the filter. Holds just
    /// `root` when nothing was filtered.
    pub complete: Vec<Arc<Snapshot>>,
}

/// Walks directories and hashes regular files.
pub struct DirectorySnapshotter {
    hasher: Arc<dyn FileHasher>,
    default_excludes: RwLock<Vec<Pattern>>,
}

struct PendingDirectory {
    path: PathBuf,
    relative: PathBuf,
    access_type: AccessType,
    depth: usize,
    children: Vec<Arc<Snapshot>>,
    complete: Vec<Arc<Snapshot>>,
    filtered: bool,
}

impl PendingDirectory {
    fn new(path: &Path, relative: PathBuf, access_type: AccessType, depth: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            relative,
            access_type,
            depth,
            children: Vec::new(),
            complete: Vec::new(),
            filtered: false,
        }
    }

    fn add(&mut self, snapshot: Arc<Snapshot>) {
        self.children.push(Arc::clone(&snapshot));
        self.complete.push(snapshot);
    }
}

impl DirectorySnapshotter {
    /// Snapshotter using [`DEFAULT_EXCLUDES`].
    #[must_use]
    pub fn new(hasher: Arc<dyn FileHasher>) -> Self {
        Self {
            hasher,
            default_excludes: RwLock::new(
                DEFAULT_EXCLUDES
                    .iter()
                    .filter_map(|p| Pattern::new(p).ok())
                    .collect(),
            ),
        }
    }

    /// Replace the names skipped by every walk.
    ///
    /// # Errors
    ///
    /// Returns `VfsError::InvalidPattern` for a pattern that does not parse;
    /// the previous excludes stay in place.
    pub fn set_default_excludes<I>(&self, patterns: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p).map_err(|source| VfsError::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        *self.default_excludes.write() = compiled;
        Ok(())
    }

    fn is_default_excluded(&self, relative: &Path) -> bool {
        self.default_excludes
            .read()
            .iter()
            .any(|pattern| matches(pattern, relative))
    }

    /// Hash a regular file.
    ///
    /// # Errors
    ///
    /// Returns `VfsError::Io` if the file cannot be read.
    pub fn snapshot_file(
        &self,
        path: &Path,
        metadata: FileMetadata,
        access_type: AccessType,
    ) -> Result<Arc<Snapshot>> {
        let hash = self
            .hasher
            .hash(path, metadata.length, metadata.last_modified)
            .map_err(|e| VfsError::io(path, e))?;
        Ok(Arc::new(Snapshot::regular_file(
            path,
            access_type,
            hash,
            metadata,
        )))
    }

    /// Walk the directory at `root`, following symlinks, in name order.
    ///
    /// # Errors
    ///
    /// Returns `VfsError::Io` if an entry cannot be read.
    pub fn snapshot_directory(
        &self,
        root: &Path,
        access_type: AccessType,
        filter: Option<&SnapshottingFilter>,
    ) -> Result<DirectoryWalk> {
        let filter = filter.filter(|f| !f.is_empty());
        let mut stack: Vec<PendingDirectory> = Vec::new();
        let mut finished: Option<PendingDirectory> = None;
        let mut walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    // A dangling symlink below the root is recorded as missing
                    let dangling = err.loop_ancestor().is_none()
                        && err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound);
                    match (dangling, err.path().map(Path::to_path_buf)) {
                        (true, Some(path)) if err.depth() > 0 => {
                            close_until(&mut stack, err.depth(), filter, &mut finished);
                            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                            if self.is_default_excluded(&relative) {
                                continue;
                            }
                            if filter.is_some_and(|f| !f.accepts_file(&relative)) {
                                mark_filtered(&mut stack);
                                continue;
                            }
                            if let Some(parent) = stack.last_mut() {
                                parent.add(Arc::new(Snapshot::missing(path, AccessType::ViaSymlink)));
                            }
                            continue;
                        }
                        _ => {
                            let path = err.path().unwrap_or(root).to_path_buf();
                            return Err(VfsError::io(path, io::Error::from(err)));
                        }
                    }
                }
            };

            let depth = entry.depth();
            close_until(&mut stack, depth, filter, &mut finished);

            let access = if depth == 0 {
                access_type
            } else if entry.path_is_symlink() {
                AccessType::ViaSymlink
            } else {
                AccessType::Direct
            };
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();

            if depth > 0 && self.is_default_excluded(&relative) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            if entry.file_type().is_dir() {
                if depth > 0 && filter.is_some_and(|f| f.is_excluded(&relative)) {
                    mark_filtered(&mut stack);
                    walker.skip_current_dir();
                    continue;
                }
                stack.push(PendingDirectory::new(entry.path(), relative, access, depth));
                continue;
            }

            if filter.is_some_and(|f| !f.accepts_file(&relative)) {
                mark_filtered(&mut stack);
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| VfsError::io(entry.path(), io::Error::from(e)))?;
            let modified = metadata
                .modified()
                .map_err(|e| VfsError::io(entry.path(), e))?;
            let snapshot = self.snapshot_file(
                entry.path(),
                FileMetadata {
                    length: metadata.len(),
                    last_modified: modified,
                },
                access,
            )?;
            if let Some(parent) = stack.last_mut() {
                parent.add(snapshot);
            }
        }
        close_until(&mut stack, 0, filter, &mut finished);

        let root_directory = finished.unwrap_or_else(|| {
            PendingDirectory::new(root, PathBuf::new(), access_type, 0)
        });
        let filtered = root_directory.filtered;
        let snapshot = Arc::new(Snapshot::directory(
            &root_directory.path,
            root_directory.access_type,
            root_directory.children,
        ));
        let complete = if filtered {
            root_directory.complete
        } else {
            vec![Arc::clone(&snapshot)]
        };
        debug!(
            root = %root.display(),
            filtered,
            entries = snapshot.children().len(),
            "Snapshotted directory"
        );
        Ok(DirectoryWalk {
            root: snapshot,
            filtered,
            complete,
        })
    }
}

fn mark_filtered(stack: &mut [PendingDirectory]) {
    if let Some(parent) = stack.last_mut() {
        parent.filtered = true;
    }
}

/// Close every open directory at `depth` or deeper, attaching each to its
/// parent. The root (depth 0) ends up in `finished`.
fn close_until(
    stack: &mut Vec<PendingDirectory>,
    depth: usize,
    filter: Option<&SnapshottingFilter>,
    finished: &mut Option<PendingDirectory>,
) {
    while stack.last().is_some_and(|top| top.depth >= depth) {
        let Some(directory) = stack.pop() else { break };
        let Some(parent) = stack.last_mut() else {
            *finished = Some(directory);
            break;
        };

        let keep = !directory.children.is_empty()
            || filter.is_none_or(|f| f.accepts_directory(&directory.relative));
        if !keep {
            parent.filtered = true;
            continue;
        }
        let snapshot = Arc::new(Snapshot::directory(
            &directory.path,
            directory.access_type,
            directory.children,
        ));
        parent.children.push(Arc::clone(&snapshot));
        if directory.filtered {
            parent.filtered = true;
            parent.complete.extend(directory.complete);
        } else {
            parent.complete.push(snapshot);
        }
    }
}
