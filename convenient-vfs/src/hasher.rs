//! Content hashing and stat.

use crate::snapshot::{AccessType, FileMetadata, HashCode};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::SystemTime;

/// Computes the content hash of a regular file.
///
/// Length and modification time are passed along so implementations can
/// cache by them without another stat.
pub trait FileHasher: Send + Sync {
    /// Hash the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read.
    fn hash(&self, path: &Path, length: u64, last_modified: SystemTime) -> io::Result<HashCode>;
}

/// Streams the file through SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFileHasher;

impl FileHasher for DefaultFileHasher {
    fn hash(&self, path: &Path, _length: u64, _last_modified: SystemTime) -> io::Result<HashCode> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(HashCode::from_digest(hasher))
    }
}

/// What a stat found at a location.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Stat {
    RegularFile(FileMetadata, AccessType),
    Directory(AccessType),
    Missing(AccessType),
}

/// Stat `path`, following a symlink if there is one.
///
/// A dangling symlink is reported as missing.
pub(crate) fn stat(path: &Path) -> io::Result<Stat> {
    let link_metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Stat::Missing(AccessType::Direct));
        }
        Err(err) => return Err(err),
    };

    let (metadata, access_type) = if link_metadata.file_type().is_symlink() {
        match fs::metadata(path) {
            Ok(target) => (target, AccessType::ViaSymlink),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Stat::Missing(AccessType::ViaSymlink));
            }
            Err(err) => return Err(err),
        }
    } else {
        (link_metadata, AccessType::Direct)
    };

    if metadata.is_dir() {
        Ok(Stat::Directory(access_type))
    } else {
        Ok(Stat::RegularFile(
            FileMetadata {
                length: metadata.len(),
                last_modified: metadata.modified()?,
            },
            access_type,
        ))
    }
}
