//! Persistent snapshot tree keyed by path segments.

use crate::snapshot::{FileType, Snapshot};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Component, Path};
use std::sync::Arc;

/// Immutable tree from absolute paths to snapshots.
///
/// Every update returns a new hierarchy that shares all untouched subtrees
/// with the old one, so a hierarchy handed to a reader never changes under
/// it.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHierarchy {
    root: Arc<Node>,
    invalidations: u64,
}

#[derive(Debug, Clone, Default)]
struct Node {
    snapshot: Option<Arc<Snapshot>>,
    children: BTreeMap<OsString, Arc<Node>>,
}

/// Number of snapshots retained, by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HierarchyStatistics {
    /// Regular files.
    pub files: usize,
    /// Directories.
    pub directories: usize,
    /// Missing locations.
    pub missing: usize,
}

impl Node {
    /// Node for `snapshot` with one child node per snapshot child.
    fn of(snapshot: &Arc<Snapshot>) -> Self {
        let children = snapshot
            .children()
            .iter()
            .map(|child| (OsString::from(child.name()), Arc::new(Self::of(child))))
            .collect();
        Self {
            snapshot: Some(Arc::clone(snapshot)),
            children,
        }
    }

    fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.children.is_empty()
    }
}

fn segments(path: &Path) -> Vec<OsString> {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .map(|component| component.as_os_str().to_os_string())
        .collect()
}

fn stored(node: Option<&Arc<Node>>, segments: &[OsString], snapshot: &Arc<Snapshot>) -> Arc<Node> {
    let Some((head, rest)) = segments.split_first() else {
        return Arc::new(Node::of(snapshot));
    };
    let mut copy = node.map(|n| Node::clone(n)).unwrap_or_default();
    let child = stored(copy.children.get(head), rest, snapshot);
    let _ = copy.children.insert(head.clone(), child);
    Arc::new(copy)
}

/// Remove the subtree at `segments` and drop the snapshot of every ancestor,
/// whose child list no longer describes the disk. Returns `None` when the
/// node ends up empty.
fn invalidated(node: &Arc<Node>, segments: &[OsString]) -> Option<Arc<Node>> {
    let (head, rest) = segments.split_first()?;
    if node.snapshot.is_none() && !node.children.contains_key(head) {
        return Some(Arc::clone(node));
    }
    let mut copy = Node::clone(node);
    copy.snapshot = None;
    if let Some(child) = copy.children.get(head).cloned() {
        match invalidated(&child, rest) {
            Some(child) => {
                let _ = copy.children.insert(head.clone(), child);
            }
            None => {
                let _ = copy.children.remove(head);
            }
        }
    }
    (!copy.is_empty()).then(|| Arc::new(copy))
}

impl SnapshotHierarchy {
    /// Hierarchy without any snapshot.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Number of invalidations applied since the hierarchy was created.
    ///
    /// Used to detect that an invalidation raced with a snapshot being
    /// computed.
    #[must_use]
    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }

    /// Snapshot stored for exactly `path`.
    #[must_use]
    pub fn find_snapshot(&self, path: &Path) -> Option<Arc<Snapshot>> {
        let mut node = &self.root;
        for segment in segments(path) {
            node = node.children.get(&segment)?;
        }
        node.snapshot.clone()
    }

    /// Store `snapshot` at `path`, replacing the subtree there. Children of a
    /// directory snapshot become retrievable at their own paths.
    #[must_use]
    pub fn store(&self, path: &Path, snapshot: Arc<Snapshot>) -> Self {
        Self {
            root: stored(Some(&self.root), &segments(path), &snapshot),
            invalidations: self.invalidations,
        }
    }

    /// Forget `path`, everything below it, and the complete snapshots of its
    /// ancestors.
    #[must_use]
    pub fn invalidate(&self, path: &Path) -> Self {
        let segments = segments(path);
        let root = if segments.is_empty() {
            Arc::default()
        } else {
            invalidated(&self.root, &segments).unwrap_or_default()
        };
        Self {
            root,
            invalidations: self.invalidations + 1,
        }
    }

    /// Forget everything.
    #[must_use]
    pub fn invalidate_all(&self) -> Self {
        Self {
            root: Arc::default(),
            invalidations: self.invalidations + 1,
        }
    }

    /// Count retained snapshots.
    #[must_use]
    pub fn statistics(&self) -> HierarchyStatistics {
        let mut statistics = HierarchyStatistics::default();
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            if let Some(snapshot) = &node.snapshot {
                match snapshot.file_type() {
                    FileType::RegularFile => statistics.files += 1,
                    FileType::Directory => statistics.directories += 1,
                    FileType::Missing => statistics.missing += 1,
                }
            }
            stack.extend(node.children.values());
        }
        statistics
    }
}
