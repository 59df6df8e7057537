//! Include/exclude filtering of file trees.

use crate::error::{Result, VfsError};
use crate::snapshot::{FileType, Snapshot};
use glob::{MatchOptions, Pattern};
use std::path::Path;
use std::sync::Arc;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Include and exclude patterns applied to paths relative to a walked root.
///
/// A pattern without `/` is matched against the entry name, a pattern with
/// `/` against the whole relative path. Rules:
///
/// - an excluded entry is dropped together with everything below it
/// - a file is kept when there are no includes or one of them matches
/// - a directory is kept when there are no includes, one of them matches,
///   or it keeps at least one child
///
/// The same rules run during a directory walk and when filtering a cached
/// snapshot, so both produce the same tree.
#[derive(Debug, Clone, Default)]
pub struct SnapshottingFilter {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl SnapshottingFilter {
    /// Filter that keeps everything.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a filter from glob patterns.
    ///
    /// # Errors
    ///
    /// Returns `VfsError::InvalidPattern` for a pattern that does not parse.
    pub fn new<I, E>(includes: I, excludes: E) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    /// Whether the filter keeps everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    /// Whether `relative` (and everything below it) is excluded.
    #[must_use]
    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.excludes.iter().any(|p| matches(p, relative))
    }

    /// Whether a regular file at `relative` is kept.
    #[must_use]
    pub fn accepts_file(&self, relative: &Path) -> bool {
        !self.is_excluded(relative) && self.is_included(relative)
    }

    /// Whether a non-excluded directory at `relative` is kept even without
    /// kept children.
    #[must_use]
    pub fn accepts_directory(&self, relative: &Path) -> bool {
        self.is_included(relative)
    }

    fn is_included(&self, relative: &Path) -> bool {
        self.includes.is_empty() || self.includes.iter().any(|p| matches(p, relative))
    }

    /// Apply the filter to an already captured snapshot.
    ///
    /// The root of a directory snapshot is always kept. A regular file root
    /// is matched by its name; a missing root is returned as is. If nothing
    /// is filtered out the input snapshot is returned unchanged.
    #[must_use]
    pub fn filter_snapshot(&self, snapshot: &Arc<Snapshot>) -> Option<Arc<Snapshot>> {
        if self.is_empty() {
            return Some(Arc::clone(snapshot));
        }
        match snapshot.file_type() {
            FileType::Directory => Some(self.filter_children(snapshot, Path::new(""))),
            FileType::RegularFile => self
                .accepts_file(Path::new(snapshot.name()))
                .then(|| Arc::clone(snapshot)),
            FileType::Missing => Some(Arc::clone(snapshot)),
        }
    }

    fn filter_children(&self, directory: &Arc<Snapshot>, relative: &Path) -> Arc<Snapshot> {
        let mut kept = Vec::with_capacity(directory.children().len());
        let mut changed = false;

        for child in directory.children() {
            let child_relative = relative.join(child.name());
            if child.file_type() == FileType::Directory {
                if self.is_excluded(&child_relative) {
                    changed = true;
                    continue;
                }
                let filtered = self.filter_children(child, &child_relative);
                if !Arc::ptr_eq(&filtered, child) {
                    changed = true;
                }
                if self.accepts_directory(&child_relative) || !filtered.children().is_empty() {
                    kept.push(filtered);
                } else {
                    changed = true;
                }
            } else if self.accepts_file(&child_relative) {
                kept.push(Arc::clone(child));
            } else {
                changed = true;
            }
        }

        if changed {
            Arc::new(Snapshot::directory(
                directory.path(),
                directory.access_type(),
                kept,
            ))
        } else {
            Arc::clone(directory)
        }
    }
}

fn compile<I>(patterns: I) -> Result<Vec<Pattern>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|pattern| {
            let pattern = pattern.as_ref();
            Pattern::new(pattern).map_err(|source| VfsError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
        })
        .collect()
}

pub(crate) fn matches(pattern: &Pattern, relative: &Path) -> bool {
    if pattern.as_str().contains('/') {
        pattern.matches_path_with(relative, MATCH_OPTIONS)
    } else {
        relative
            .file_name()
            .is_some_and(|name| pattern.matches_with(&name.to_string_lossy(), MATCH_OPTIONS))
    }
}
