//! Process-wide services a build runs with.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::lease::WorkerLeaseService;
use crate::plan::PlanExecutor;
use crate::work::build_cache::LocalBuildCache;
use crate::work::engine::ExecutionEngine;
use crate::work::history::{
    ExecutionHistoryStore, InMemoryExecutionHistoryStore, PersistentExecutionHistoryStore,
};
use crate::work::workspace::HashedWorkspaceProvider;
use convenient_filelock::{
    DefaultFileLockContentionHandler, DefaultProcessMetaDataProvider, FileLockContentionHandler,
    FileLockManager, NoOpContentionHandler,
};
use convenient_vfs::{
    DefaultFileHasher, FileSystemAccess, FileWatcher, LocationsWrittenByCurrentBuild,
    VirtualFileSystem, WriteListener,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Services created once per process and shared by every build.
pub struct BuildServices {
    config: EngineConfig,
    root: Option<PathBuf>,
    locks: FileLockManager,
    file_system: Arc<FileSystemAccess>,
    watcher: Option<FileWatcher>,
    engine: ExecutionEngine,
    leases: WorkerLeaseService,
}

impl fmt::Debug for BuildServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildServices")
            .field("config", &self.config)
            .field("root", &self.root)
            .field("watching", &self.watcher.is_some())
            .field("leases", &self.leases)
            .finish_non_exhaustive()
    }
}

impl BuildServices {
    /// Services keeping execution history in memory, with workspaces below
    /// `workspace_root` and no build cache.
    ///
    /// # Errors
    ///
    /// The configuration is invalid.
    pub fn in_memory(config: EngineConfig, workspace_root: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let locks = lock_manager(&config);
        let (file_system, watcher) = file_system(&config)?;
        let engine = ExecutionEngine::new(
            Arc::clone(&file_system),
            Arc::new(InMemoryExecutionHistoryStore::new()),
            Arc::new(HashedWorkspaceProvider::new(workspace_root)),
        );
        Ok(Self::assemble(config, None, locks, file_system, watcher, engine))
    }

    /// Services persisting history, workspaces and the build cache in the
    /// configured cache directory, resolved against `root`.
    ///
    /// # Errors
    ///
    /// The configuration is invalid or the cache directory cannot be
    /// prepared.
    pub fn open(config: EngineConfig, root: &Path) -> Result<Self> {
        config.validate()?;
        let cache_dir = root.join(&config.cache_dir);
        let locks = lock_manager(&config);
        let (file_system, watcher) = file_system(&config)?;
        let history: Arc<dyn ExecutionHistoryStore> = Arc::new(
            PersistentExecutionHistoryStore::open(&cache_dir.join("history"), locks.clone())?,
        );
        let mut engine = ExecutionEngine::new(
            Arc::clone(&file_system),
            history,
            Arc::new(HashedWorkspaceProvider::new(cache_dir.join("workspaces"))),
        );
        if config.build_cache_enabled {
            let cache = LocalBuildCache::open(cache_dir.join("build-cache"), locks.clone())?;
            engine = engine.with_build_cache(Arc::new(cache));
        }
        info!(cache_dir = %cache_dir.display(), "Opened build services");
        Ok(Self::assemble(
            config,
            Some(root.to_path_buf()),
            locks,
            file_system,
            watcher,
            engine,
        ))
    }

    fn assemble(
        config: EngineConfig,
        root: Option<PathBuf>,
        locks: FileLockManager,
        file_system: Arc<FileSystemAccess>,
        watcher: Option<FileWatcher>,
        engine: ExecutionEngine,
    ) -> Self {
        Self {
            leases: WorkerLeaseService::default(),
            config,
            root,
            locks,
            file_system,
            watcher,
            engine,
        }
    }

    /// Configuration the services were created with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cross-process lock manager.
    #[must_use]
    pub fn lock_manager(&self) -> &FileLockManager {
        &self.locks
    }

    /// Cached file system access.
    #[must_use]
    pub fn file_system(&self) -> &Arc<FileSystemAccess> {
        &self.file_system
    }

    /// Engine running units of work.
    #[must_use]
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Leases bounding concurrently running builds.
    #[must_use]
    pub fn leases(&self) -> &WorkerLeaseService {
        &self.leases
    }

    /// Plan executor sized by the configuration.
    #[must_use]
    pub fn plan_executor(&self) -> PlanExecutor {
        PlanExecutor::new(self.config.max_workers, self.config.fail_fast)
    }

    /// Start watching the project root, if enabled.
    pub fn build_started(&self) {
        let Some(watcher) = &self.watcher else {
            return;
        };
        if let Err(err) = watcher.after_build_started(self.root.iter().cloned()) {
            warn!(error = %err, "Watching the file system failed; snapshots will not be retained");
        }
    }

    /// Stop recording writes of the finished build.
    pub fn build_finished(&self) {
        match &self.watcher {
            Some(watcher) => watcher.before_build_finished(),
            // Nothing tells us about outside changes between builds.
            None => self.file_system.virtual_file_system().invalidate_all(),
        }
    }
}

fn lock_manager(config: &EngineConfig) -> FileLockManager {
    let contention: Arc<dyn FileLockContentionHandler> = if config.contention_ping {
        Arc::new(DefaultFileLockContentionHandler::new())
    } else {
        Arc::new(NoOpContentionHandler)
    };
    FileLockManager::new(
        Arc::new(DefaultProcessMetaDataProvider),
        config.lock_timeout(),
        contention,
    )
}

fn file_system(config: &EngineConfig) -> Result<(Arc<FileSystemAccess>, Option<FileWatcher>)> {
    let vfs = Arc::new(VirtualFileSystem::new());
    let mut access = FileSystemAccess::new(Arc::clone(&vfs), Arc::new(DefaultFileHasher));
    let watcher = if config.watch_file_system {
        let written = Arc::new(LocationsWrittenByCurrentBuild::default());
        let listener: Arc<dyn WriteListener> = Arc::clone(&written) as Arc<dyn WriteListener>;
        access = access.with_write_listener(listener);
        Some(FileWatcher::new(vfs, written))
    } else {
        None
    };
    access.update_default_excludes(&config.default_excludes)?;
    Ok((Arc::new(access), watcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::engine::ExecutionOutcome;
    use crate::work::{FileInput, FnWork, WorkResult};
    use std::fs;
    use tempfile::TempDir;

    fn config() -> EngineConfig {
        EngineConfig {
            max_workers: 2,
            contention_ping: false,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            max_workers: 0,
            ..config()
        };
        assert!(BuildServices::in_memory(config, temp.path()).is_err());
    }

    #[test]
    fn test_history_survives_reopening() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("in.txt");
        let out = temp.path().join("out");
        fs::write(&src, "hello").unwrap();
        let work = FnWork::new("copy", {
            let (src, out) = (src.clone(), out.clone());
            move |_| {
                fs::create_dir_all(&out)?;
                let _ = fs::copy(&src, out.join("in.txt"))?;
                Ok(WorkResult::DidWork)
            }
        })
        .input_files("src", FileInput::paths([src.clone()]))
        .output_dir("out", out.clone());

        {
            let services = BuildServices::open(config(), temp.path()).unwrap();
            let result = services.engine().execute(&work).unwrap();
            assert_eq!(result.outcome, ExecutionOutcome::Executed(WorkResult::DidWork));
            services.build_finished();
        }
        let services = BuildServices::open(config(), temp.path()).unwrap();
        let result = services.engine().execute(&work).unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::UpToDate);
        assert!(temp.path().join(".convenient").join("history").is_dir());
    }
}
