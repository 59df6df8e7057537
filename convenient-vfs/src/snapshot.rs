//! Immutable file system snapshots.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;

/// SHA-256 hash of file content or of a derived structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashCode([u8; 32]);

static DIRECTORY_SIGNATURE: LazyLock<HashCode> =
    LazyLock::new(|| HashCode::of_bytes(b"SIGNATURE:DIRECTORY"));
static MISSING_FILE_SIGNATURE: LazyLock<HashCode> =
    LazyLock::new(|| HashCode::of_bytes(b"SIGNATURE:MISSING_FILE"));

impl HashCode {
    /// Wrap a raw digest.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a byte slice.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self::from_digest(Sha256::new_with_prefix(bytes))
    }

    /// Finish a running SHA-256 computation.
    #[must_use]
    pub fn from_digest(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    /// Parse a 64 character hex string.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Sentinel used as the hash of every directory entry.
    #[must_use]
    pub fn directory_signature() -> Self {
        *DIRECTORY_SIGNATURE
    }

    /// Sentinel used as the hash of every missing entry.
    #[must_use]
    pub fn missing_file_signature() -> Self {
        *MISSING_FILE_SIGNATURE
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps snapshot debug output readable
        write!(f, "HashCode({})", &self.to_hex()[..8])
    }
}

impl Serialize for HashCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid hash code '{hex}'")))
    }
}

/// Type of a file system location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileType {
    /// A regular file.
    RegularFile,
    /// A directory.
    Directory,
    /// Nothing exists at the location.
    Missing,
}

/// How a location was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    /// The path itself is the file or directory.
    Direct,
    /// The path is a symbolic link that was followed.
    ViaSymlink,
}

/// Metadata captured for regular files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// Length in bytes.
    pub length: u64,
    /// Last modification time.
    pub last_modified: SystemTime,
}

/// Variant data of a [`Snapshot`].
#[derive(Debug, Clone)]
pub enum SnapshotKind {
    /// A regular file with its content hash.
    RegularFile {
        /// Hash of the file content.
        content_hash: HashCode,
        /// Metadata at snapshot time.
        metadata: FileMetadata,
    },
    /// A directory with its (possibly filtered) children, sorted by name.
    Directory {
        /// Hash over the children's names and hashes.
        tree_hash: HashCode,
        /// Children snapshots.
        children: Vec<Arc<Snapshot>>,
    },
    /// Nothing exists at the location.
    Missing,
}

/// Immutable record of a location at the time it was read.
///
/// Two snapshots are equal when they describe the same path with the same
/// type and hash (for directories, the hash over their children).
#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
    name: String,
    access_type: AccessType,
    kind: SnapshotKind,
}

impl Snapshot {
    /// Snapshot of a regular file.
    #[must_use]
    pub fn regular_file(
        path: impl Into<PathBuf>,
        access_type: AccessType,
        content_hash: HashCode,
        metadata: FileMetadata,
    ) -> Self {
        Self::new(
            path.into(),
            access_type,
            SnapshotKind::RegularFile {
                content_hash,
                metadata,
            },
        )
    }

    /// Snapshot of a directory. Children are sorted by name.
    #[must_use]
    pub fn directory(
        path: impl Into<PathBuf>,
        access_type: AccessType,
        mut children: Vec<Arc<Snapshot>>,
    ) -> Self {
        children.sort_by(|a, b| a.name.cmp(&b.name));
        let mut hasher = Sha256::new_with_prefix(b"DIRECTORY");
        for child in &children {
            hasher.update(child.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(child.identity_hash().as_bytes());
        }
        let tree_hash = HashCode::from_digest(hasher);
        Self::new(
            path.into(),
            access_type,
            SnapshotKind::Directory {
                tree_hash,
                children,
            },
        )
    }

    /// Snapshot of a missing location.
    #[must_use]
    pub fn missing(path: impl Into<PathBuf>, access_type: AccessType) -> Self {
        Self::new(path.into(), access_type, SnapshotKind::Missing)
    }

    fn new(path: PathBuf, access_type: AccessType, kind: SnapshotKind) -> Self {
        let name = path.file_name().map_or_else(
            || path.to_string_lossy().into_owned(),
            |name| name.to_string_lossy().into_owned(),
        );
        Self {
            path,
            name,
            access_type,
            kind,
        }
    }

    /// Absolute path of the location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last path segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the path was reached through a symlink.
    #[must_use]
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    /// Variant data.
    #[must_use]
    pub fn kind(&self) -> &SnapshotKind {
        &self.kind
    }

    /// Type of the location.
    #[must_use]
    pub fn file_type(&self) -> FileType {
        match self.kind {
            SnapshotKind::RegularFile { .. } => FileType::RegularFile,
            SnapshotKind::Directory { .. } => FileType::Directory,
            SnapshotKind::Missing => FileType::Missing,
        }
    }

    /// Hash used when fingerprinting this single entry: the content hash
    /// for regular files, a fixed signature for directories and missing
    /// locations.
    #[must_use]
    pub fn hash(&self) -> HashCode {
        match &self.kind {
            SnapshotKind::RegularFile { content_hash, .. } => *content_hash,
            SnapshotKind::Directory { .. } => HashCode::directory_signature(),
            SnapshotKind::Missing => HashCode::missing_file_signature(),
        }
    }

    /// Hash that covers the whole subtree.
    #[must_use]
    pub fn identity_hash(&self) -> HashCode {
        match &self.kind {
            SnapshotKind::Directory { tree_hash, .. } => *tree_hash,
            _ => self.hash(),
        }
    }

    /// Content hash for regular files.
    #[must_use]
    pub fn content_hash(&self) -> Option<HashCode> {
        match &self.kind {
            SnapshotKind::RegularFile { content_hash, .. } => Some(*content_hash),
            _ => None,
        }
    }

    /// Metadata for regular files.
    #[must_use]
    pub fn metadata(&self) -> Option<FileMetadata> {
        match &self.kind {
            SnapshotKind::RegularFile { metadata, .. } => Some(*metadata),
            _ => None,
        }
    }

    /// Children of a directory; empty for other types.
    #[must_use]
    pub fn children(&self) -> &[Arc<Snapshot>] {
        match &self.kind {
            SnapshotKind::Directory { children, .. } => children,
            _ => &[],
        }
    }

    /// This snapshot and all descendants in pre-order, each paired with its
    /// path relative to this snapshot (empty for the snapshot itself).
    #[must_use]
    pub fn entries(self: &Arc<Self>) -> Vec<(PathBuf, Arc<Snapshot>)> {
        let mut entries = Vec::new();
        let mut stack = vec![(PathBuf::new(), Arc::clone(self))];
        while let Some((relative, snapshot)) = stack.pop() {
            for child in snapshot.children().iter().rev() {
                stack.push((relative.join(&child.name), Arc::clone(child)));
            }
            entries.push((relative, snapshot));
        }
        entries
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.file_type() == other.file_type()
            && self.identity_hash() == other.identity_hash()
    }
}

impl Eq for Snapshot {}
