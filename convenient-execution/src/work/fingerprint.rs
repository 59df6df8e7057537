//! Fingerprints of file collections.

use crate::work::value::append_bytes;
use convenient_vfs::{FileType, HashCode, Snapshot};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which part of a file's path takes part in the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PathNormalizer {
    /// The absolute path; moving the project changes the fingerprint.
    #[default]
    AbsolutePath,
    /// The path relative to the collection root it was found under.
    RelativePath,
    /// The file name only.
    NameOnly,
}

impl PathNormalizer {
    fn normalize(self, snapshot: &Snapshot, relative: &Path, is_root: bool) -> String {
        match self {
            Self::AbsolutePath => snapshot.path().to_string_lossy().into_owned(),
            Self::NameOnly => snapshot.name().to_string(),
            // A root file is identified by its name, a root directory by nothing
            Self::RelativePath if is_root => match snapshot.file_type() {
                FileType::Directory => String::new(),
                _ => snapshot.name().to_string(),
            },
            Self::RelativePath => relative.to_string_lossy().into_owned(),
        }
    }
}

/// One fingerprinted file system entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    /// Path after normalization.
    pub normalized_path: String,
    /// Entry type.
    pub file_type: FileType,
    /// Content hash or type sentinel.
    pub hash: HashCode,
}

/// Fingerprint of every entry below a set of roots.
///
/// Entries are keyed by absolute path so that changes can be listed per
/// file; the overall hash covers the normalized paths and hashes only and
/// does not depend on the order roots were given in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCollectionFingerprint {
    entries: BTreeMap<PathBuf, FingerprintEntry>,
    hash: HashCode,
}

impl Default for FileCollectionFingerprint {
    fn default() -> Self {
        Self::from_entries(BTreeMap::new())
    }
}

impl FileCollectionFingerprint {
    /// Fingerprint of no files.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Fingerprint the snapshots in `roots` and everything below them.
    #[must_use]
    pub fn from_snapshots(roots: &[Arc<Snapshot>], normalizer: PathNormalizer) -> Self {
        let mut entries = BTreeMap::new();
        for root in roots {
            for (relative, snapshot) in root.entries() {
                let is_root = relative.as_os_str().is_empty();
                let _ = entries.insert(
                    snapshot.path().to_path_buf(),
                    FingerprintEntry {
                        normalized_path: normalizer.normalize(&snapshot, &relative, is_root),
                        file_type: snapshot.file_type(),
                        hash: snapshot.hash(),
                    },
                );
            }
        }
        Self::from_entries(entries)
    }

    fn from_entries(entries: BTreeMap<PathBuf, FingerprintEntry>) -> Self {
        let mut normalized: Vec<&FingerprintEntry> = entries.values().collect();
        normalized.sort_by(|a, b| {
            a.normalized_path
                .cmp(&b.normalized_path)
                .then(a.hash.cmp(&b.hash))
        });
        let mut hasher = Sha256::new_with_prefix(b"FILE_COLLECTION");
        for entry in normalized {
            append_bytes(&mut hasher, entry.normalized_path.as_bytes());
            hasher.update(entry.hash.as_bytes());
        }
        Self {
            entries,
            hash: HashCode::from_digest(hasher),
        }
    }

    /// Overall hash.
    #[must_use]
    pub fn hash(&self) -> HashCode {
        self.hash
    }

    /// Entries by absolute path.
    #[must_use]
    pub fn entries(&self) -> &BTreeMap<PathBuf, FingerprintEntry> {
        &self.entries
    }

    /// Absolute paths of the regular files.
    pub fn regular_files(&self) -> impl Iterator<Item = &Path> {
        self.entries
            .iter()
            .filter(|(_, e)| e.file_type == FileType::RegularFile)
            .map(|(p, _)| p.as_path())
    }

    /// Whether no entry exists on disk.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|e| e.file_type == FileType::Missing)
    }

    /// Changes from `previous` to this fingerprint, by absolute path.
    #[must_use]
    pub fn changes_since(&self, previous: &Self) -> FileChanges {
        let mut changes = FileChanges::default();
        for (path, entry) in &self.entries {
            if entry.file_type == FileType::Missing {
                continue;
            }
            match previous.entries.get(path) {
                Some(old) if old.file_type != FileType::Missing => {
                    if old.hash != entry.hash || old.file_type != entry.file_type {
                        changes.modified.push(path.clone());
                    }
                }
                _ => changes.added.push(path.clone()),
            }
        }
        for (path, old) in &previous.entries {
            let still_there = self
                .entries
                .get(path)
                .is_some_and(|e| e.file_type != FileType::Missing);
            if old.file_type != FileType::Missing && !still_there {
                changes.removed.push(path.clone());
            }
        }
        changes
    }

    /// Every existing entry reported as added.
    #[must_use]
    pub fn all_added(&self) -> FileChanges {
        self.changes_since(&Self::empty())
    }
}

/// Added, modified and removed paths of one file property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChanges {
    /// Present now, absent before.
    pub added: Vec<PathBuf>,
    /// Present in both with a different hash or type.
    pub modified: Vec<PathBuf>,
    /// Present before, absent now.
    pub removed: Vec<PathBuf>,
}

impl FileChanges {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convenient_vfs::{AccessType, FileMetadata};
    use std::time::SystemTime;

    fn file(path: &str, content: &[u8]) -> Arc<Snapshot> {
        Arc::new(Snapshot::regular_file(
            path,
            AccessType::Direct,
            HashCode::of_bytes(content),
            FileMetadata {
                length: content.len() as u64,
                last_modified: SystemTime::UNIX_EPOCH,
            },
        ))
    }

    fn dir(path: &str, children: Vec<Arc<Snapshot>>) -> Arc<Snapshot> {
        Arc::new(Snapshot::directory(path, AccessType::Direct, children))
    }

    #[test]
    fn test_root_order_does_not_matter() {
        let a = file("/src/A.java", b"class A {}");
        let b = file("/src/B.java", b"class B {}");
        let forward = FileCollectionFingerprint::from_snapshots(&[a.clone(), b.clone()], PathNormalizer::AbsolutePath);
        let backward = FileCollectionFingerprint::from_snapshots(&[b, a], PathNormalizer::AbsolutePath);
        assert_eq!(forward.hash(), backward.hash());
    }

    #[test]
    fn test_relative_paths_survive_relocation() {
        let here = dir("/p1/src", vec![file("/p1/src/A.java", b"a")]);
        let there = dir("/p2/src", vec![file("/p2/src/A.java", b"a")]);
        let relative = |s: &Arc<Snapshot>| {
            FileCollectionFingerprint::from_snapshots(&[s.clone()], PathNormalizer::RelativePath).hash()
        };
        let absolute = |s: &Arc<Snapshot>| {
            FileCollectionFingerprint::from_snapshots(&[s.clone()], PathNormalizer::AbsolutePath).hash()
        };
        assert_eq!(relative(&here), relative(&there));
        assert_ne!(absolute(&here), absolute(&there));
    }

    #[test]
    fn test_name_only_keeps_names_not_locations() {
        let nested = dir("/a", vec![dir("/a/x", vec![file("/a/x/lib.jar", b"jar")])]);
        let flat = dir("/a", vec![dir("/a/y", vec![file("/a/y/lib.jar", b"jar")])]);
        let fp = |s: &Arc<Snapshot>| {
            FileCollectionFingerprint::from_snapshots(&[s.clone()], PathNormalizer::NameOnly).hash()
        };
        assert_ne!(fp(&nested), fp(&flat));
        let only_file = |p: &str| {
            FileCollectionFingerprint::from_snapshots(&[file(p, b"jar")], PathNormalizer::NameOnly).hash()
        };
        assert_eq!(only_file("/a/x/lib.jar"), only_file("/b/lib.jar"));
    }

    #[test]
    fn test_changes_since_previous() {
        let before = FileCollectionFingerprint::from_snapshots(
            &[file("/s/A.java", b"1"), file("/s/B.java", b"1")],
            PathNormalizer::AbsolutePath,
        );
        let after = FileCollectionFingerprint::from_snapshots(
            &[file("/s/A.java", b"2"), file("/s/C.java", b"1")],
            PathNormalizer::AbsolutePath,
        );
        let changes = after.changes_since(&before);
        assert_eq!(changes.modified, vec![PathBuf::from("/s/A.java")]);
        assert_eq!(changes.added, vec![PathBuf::from("/s/C.java")]);
        assert_eq!(changes.removed, vec![PathBuf::from("/s/B.java")]);
        assert_eq!(after.all_added().added.len(), 2);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let missing = Arc::new(Snapshot::missing("/nope", AccessType::Direct));
        let fp = FileCollectionFingerprint::from_snapshots(&[missing], PathNormalizer::AbsolutePath);
        assert!(fp.is_empty());
        assert_ne!(fp.hash(), FileCollectionFingerprint::empty().hash());
    }
}
