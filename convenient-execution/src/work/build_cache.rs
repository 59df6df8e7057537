//! Local build cache: output trees stored by cache key.
//!
//! Layout below the cache root:
//!
//! ```text
//! cas/<2 hex>/<sha256>        file contents, stored once
//! manifests/<cache key>.json  which file of which output property has
//!                             which content
//! ```
//!
//! All access happens under one exclusive cross-process lock on the root.

use crate::error::{ExecutionError, Result};
use crate::work::caching::BuildCacheKey;
use crate::work::{OutputProperty, TreeType};
use convenient_filelock::{FileLockManager, LockMode, LockOnDemandCacheAccess, LockOptions};
use convenient_vfs::HashCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Write `data` to `path` through a temp file, fsync and rename, so readers
/// see either the old or the new content.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;

    // Some file systems cannot sync directories
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedOutput {
    tree_type: CachedTreeType,
    /// Relative path (empty for a file output) to content hash.
    files: BTreeMap<PathBuf, HashCode>,
    directories: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CachedTreeType {
    File,
    Directory,
}

impl From<TreeType> for CachedTreeType {
    fn from(tree_type: TreeType) -> Self {
        match tree_type {
            TreeType::File => Self::File,
            TreeType::Directory => Self::Directory,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    outputs: BTreeMap<String, CachedOutput>,
}

/// Content-addressed store of work outputs keyed by [`BuildCacheKey`].
pub struct LocalBuildCache {
    root: PathBuf,
    access: LockOnDemandCacheAccess,
}

impl std::fmt::Debug for LocalBuildCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBuildCache").field("root", &self.root).finish_non_exhaustive()
    }
}

impl LocalBuildCache {
    /// Open the cache at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// The root cannot be created.
    pub fn open(root: impl Into<PathBuf>, locks: FileLockManager) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("cas"))?;
        fs::create_dir_all(root.join("manifests"))?;
        let access = LockOnDemandCacheAccess::new(
            "build cache",
            root.clone(),
            LockOptions::mode(LockMode::Exclusive),
            locks,
        );
        Ok(Self { root, access })
    }

    fn manifest_path(&self, key: &BuildCacheKey) -> PathBuf {
        self.root.join("manifests").join(format!("{}.json", key.to_hex()))
    }

    fn object_path(&self, hash: &HashCode) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join("cas").join(&hex[..2]).join(hex)
    }

    /// Whether an entry for `key` exists.
    ///
    /// # Errors
    ///
    /// The cache could not be locked.
    pub fn contains(&self, key: &BuildCacheKey) -> Result<bool> {
        let path = self.manifest_path(key);
        Ok(self.access.with_file_lock(|| path.is_file())?)
    }

    /// Store the current content of `outputs` under `key`. Missing outputs
    /// are stored as absent.
    ///
    /// # Errors
    ///
    /// Reading an output or writing the cache failed.
    pub fn store(&self, key: &BuildCacheKey, outputs: &[OutputProperty]) -> Result<()> {
        self.access.with_file_lock(|| -> Result<()> {
            let mut manifest = Manifest::default();
            for output in outputs {
                if let Some(cached) = self.store_output(output)? {
                    let _ = manifest.outputs.insert(output.name.clone(), cached);
                }
            }
            atomic_write(&self.manifest_path(key), &serde_json::to_vec_pretty(&manifest)?)?;
            info!(key = %key, outputs = manifest.outputs.len(), "Stored outputs in build cache");
            Ok(())
        })?
    }

    fn store_output(&self, output: &OutputProperty) -> Result<Option<CachedOutput>> {
        let mut cached = CachedOutput {
            tree_type: output.tree_type.into(),
            files: BTreeMap::new(),
            directories: Vec::new(),
        };
        match output.tree_type {
            TreeType::File => {
                if !output.root.is_file() {
                    return Ok(None);
                }
                let hash = self.put(&output.root)?;
                let _ = cached.files.insert(PathBuf::new(), hash);
            }
            TreeType::Directory => {
                if !output.root.is_dir() {
                    return Ok(None);
                }
                for entry in WalkDir::new(&output.root).sort_by_file_name() {
                    let entry = entry.map_err(|e| ExecutionError::Io(e.into()))?;
                    let relative = entry
                        .path()
                        .strip_prefix(&output.root)
                        .unwrap_or(entry.path())
                        .to_path_buf();
                    if entry.file_type().is_dir() {
                        if !relative.as_os_str().is_empty() {
                            cached.directories.push(relative);
                        }
                    } else if entry.file_type().is_file() {
                        let hash = self.put(entry.path())?;
                        let _ = cached.files.insert(relative, hash);
                    }
                }
            }
        }
        Ok(Some(cached))
    }

    fn put(&self, file: &Path) -> Result<HashCode> {
        let content = fs::read(file)?;
        let hash = HashCode::of_bytes(&content);
        let path = self.object_path(&hash);
        if !path.exists() {
            atomic_write(&path, &content)?;
        }
        Ok(hash)
    }

    /// Restore the outputs stored under `key` into `outputs`, replacing
    /// what is there. Returns `false` without touching anything when there
    /// is no entry.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::CorruptCacheEntry` if the entry does not
    /// match the outputs or refers to missing content.
    pub fn load(&self, key: &BuildCacheKey, outputs: &[OutputProperty]) -> Result<bool> {
        self.access.with_file_lock(|| -> Result<bool> {
            let path = self.manifest_path(key);
            if !path.is_file() {
                debug!(key = %key, "Build cache miss");
                return Ok(false);
            }
            let manifest: Manifest = serde_json::from_slice(&fs::read(&path)?)?;
            for (name, cached) in &manifest.outputs {
                let output = outputs.iter().find(|o| &o.name == name).ok_or_else(|| {
                    ExecutionError::CorruptCacheEntry {
                        key: key.to_hex(),
                        reason: format!("unknown output property '{name}'"),
                    }
                })?;
                if cached.tree_type != output.tree_type.into() {
                    return Err(ExecutionError::CorruptCacheEntry {
                        key: key.to_hex(),
                        reason: format!("output property '{name}' changed its type"),
                    });
                }
                for hash in cached.files.values() {
                    if !self.object_path(hash).is_file() {
                        return Err(ExecutionError::CorruptCacheEntry {
                            key: key.to_hex(),
                            reason: format!("content {hash} is missing"),
                        });
                    }
                }
            }
            for output in outputs {
                remove_location(&output.root)?;
                if let Some(cached) = manifest.outputs.get(&output.name) {
                    self.restore(output, cached)?;
                }
            }
            info!(key = %key, "Loaded outputs from build cache");
            Ok(true)
        })?
    }

    fn restore(&self, output: &OutputProperty, cached: &CachedOutput) -> Result<()> {
        if cached.tree_type == CachedTreeType::Directory {
            fs::create_dir_all(&output.root)?;
        }
        for directory in &cached.directories {
            fs::create_dir_all(output.root.join(directory))?;
        }
        for (relative, hash) in &cached.files {
            let target = if relative.as_os_str().is_empty() {
                output.root.clone()
            } else {
                output.root.join(relative)
            };
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let _ = fs::copy(self.object_path(hash), &target)?;
        }
        Ok(())
    }
}

/// Delete a file or directory tree if it exists.
pub(crate) fn remove_location(location: &Path) -> Result<()> {
    match fs::symlink_metadata(location) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(location)?,
        Ok(_) => fs::remove_file(location)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::caching::BeforeExecutionState;
    use crate::work::value::{ImplementationSnapshot, ValueSnapshot};
    use convenient_filelock::{
        DEFAULT_LOCK_TIMEOUT, DefaultProcessMetaDataProvider, NoOpContentionHandler,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager() -> FileLockManager {
        FileLockManager::new(
            Arc::new(DefaultProcessMetaDataProvider),
            DEFAULT_LOCK_TIMEOUT,
            Arc::new(NoOpContentionHandler),
        )
    }

    fn key(value: &str) -> BuildCacheKey {
        BeforeExecutionState {
            implementation: ImplementationSnapshot::new("Jar", "1"),
            additional_implementations: Vec::new(),
            input_properties: BTreeMap::from([("v".to_string(), ValueSnapshot::from(value))]),
            input_file_properties: BTreeMap::new(),
            output_file_location_snapshots: BTreeMap::new(),
        }
        .cache_key()
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/file.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_store_and_load_outputs() {
        let temp = TempDir::new().unwrap();
        let cache = LocalBuildCache::open(temp.path().join("cache"), manager()).unwrap();
        let classes = temp.path().join("out/classes");
        fs::create_dir_all(classes.join("pkg")).unwrap();
        fs::write(classes.join("pkg/A.class"), b"A").unwrap();
        let jar = temp.path().join("out/app.jar");
        fs::write(&jar, b"jar").unwrap();
        let outputs = vec![
            OutputProperty {
                name: "classes".to_string(),
                tree_type: TreeType::Directory,
                root: classes.clone(),
            },
            OutputProperty {
                name: "jar".to_string(),
                tree_type: TreeType::File,
                root: jar.clone(),
            },
        ];

        let key = key("a");
        assert!(!cache.load(&key, &outputs).unwrap());
        cache.store(&key, &outputs).unwrap();
        assert!(cache.contains(&key).unwrap());

        fs::remove_dir_all(temp.path().join("out")).unwrap();
        assert!(cache.load(&key, &outputs).unwrap());
        assert_eq!(fs::read(classes.join("pkg/A.class")).unwrap(), b"A");
        assert_eq!(fs::read(&jar).unwrap(), b"jar");
    }

    #[test]
    fn test_load_replaces_stale_outputs() {
        let temp = TempDir::new().unwrap();
        let cache = LocalBuildCache::open(temp.path().join("cache"), manager()).unwrap();
        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("kept.txt"), b"kept").unwrap();
        let outputs = vec![OutputProperty {
            name: "dir".to_string(),
            tree_type: TreeType::Directory,
            root: out.clone(),
        }];
        let key = key("b");
        cache.store(&key, &outputs).unwrap();

        fs::write(out.join("stale.txt"), b"stale").unwrap();
        assert!(cache.load(&key, &outputs).unwrap());
        assert!(out.join("kept.txt").is_file());
        assert!(!out.join("stale.txt").exists());
    }

    #[test]
    fn test_missing_content_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        let cache = LocalBuildCache::open(&root, manager()).unwrap();
        let file = temp.path().join("out.txt");
        fs::write(&file, b"x").unwrap();
        let outputs = vec![OutputProperty {
            name: "out".to_string(),
            tree_type: TreeType::File,
            root: file.clone(),
        }];
        let key = key("c");
        cache.store(&key, &outputs).unwrap();
        fs::remove_dir_all(root.join("cas")).unwrap();

        let err = cache.load(&key, &outputs).unwrap_err();
        assert!(matches!(err, ExecutionError::CorruptCacheEntry { .. }));
        assert!(file.is_file(), "outputs are untouched when the entry is corrupt");
    }
}
