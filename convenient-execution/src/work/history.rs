//! Execution history: what each unit of work saw and produced last time.

use crate::error::Result;
use crate::work::build_cache::atomic_write;
use crate::work::fingerprint::FileCollectionFingerprint;
use crate::work::value::{ImplementationSnapshot, ValueSnapshot};
use convenient_filelock::{
    BoxError, CacheInitializationAction, FileLock, FileLockManager, LockMode,
    LockOnDemandCacheAccess, LockOptions,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// State recorded after a unit of work executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousExecutionState {
    /// Implementation of the work.
    pub implementation: ImplementationSnapshot,
    /// Further implementations.
    pub additional_implementations: Vec<ImplementationSnapshot>,
    /// Value inputs.
    pub input_properties: BTreeMap<String, ValueSnapshot>,
    /// File inputs.
    pub input_file_properties: BTreeMap<String, FileCollectionFingerprint>,
    /// Outputs as they were right after the execution.
    pub output_files_produced_by_work: BTreeMap<String, FileCollectionFingerprint>,
    /// Whether the execution succeeded. A failed execution is never up to
    /// date.
    pub successful: bool,
}

/// Storage for [`PreviousExecutionState`] by work identity.
pub trait ExecutionHistoryStore: Send + Sync {
    /// State recorded for `identity`.
    ///
    /// # Errors
    ///
    /// The store could not be read.
    fn load(&self, identity: &str) -> Result<Option<PreviousExecutionState>>;

    /// Record `state` for `identity`, replacing earlier state.
    ///
    /// # Errors
    ///
    /// The store could not be written.
    fn store(&self, identity: &str, state: PreviousExecutionState) -> Result<()>;

    /// Forget `identity`.
    ///
    /// # Errors
    ///
    /// The store could not be written.
    fn remove(&self, identity: &str) -> Result<()>;
}

/// History kept for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryExecutionHistoryStore {
    states: RwLock<HashMap<String, PreviousExecutionState>>,
}

impl InMemoryExecutionHistoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionHistoryStore for InMemoryExecutionHistoryStore {
    fn load(&self, identity: &str) -> Result<Option<PreviousExecutionState>> {
        Ok(self.states.read().get(identity).cloned())
    }

    fn store(&self, identity: &str, state: PreviousExecutionState) -> Result<()> {
        let _ = self.states.write().insert(identity.to_string(), state);
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<()> {
        let _ = self.states.write().remove(identity);
        Ok(())
    }
}

const HISTORY_FILE: &str = "execution-history.json";

struct InitializeHistory {
    file: PathBuf,
}

impl CacheInitializationAction for InitializeHistory {
    fn requires_initialization(&self, lock: &FileLock) -> bool {
        // Never written cleanly, or a writer died halfway
        lock.state()
            .map_or(true, |state| state.is_in_initial_state() || state.is_dirty())
    }

    fn initialize(&self) -> std::result::Result<(), BoxError> {
        debug!(file = %self.file.display(), "Initializing execution history");
        atomic_write(&self.file, b"{}").map_err(Into::into)
    }
}

/// History persisted as JSON in a directory shared between processes.
///
/// Every access holds the directory's cross-process lock, and the first
/// access after an unclean shutdown starts over with an empty history.
pub struct PersistentExecutionHistoryStore {
    file: PathBuf,
    access: LockOnDemandCacheAccess,
}

impl std::fmt::Debug for PersistentExecutionHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentExecutionHistoryStore")
            .field("file", &self.file)
            .finish_non_exhaustive()
    }
}

impl PersistentExecutionHistoryStore {
    /// Open the history kept in `dir`.
    ///
    /// # Errors
    ///
    /// The directory cannot be created.
    pub fn open(dir: &Path, locks: FileLockManager) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = dir.join(HISTORY_FILE);
        let access = LockOnDemandCacheAccess::with_hooks(
            "execution history",
            dir,
            LockOptions::mode(LockMode::Exclusive),
            locks,
            Some(Box::new(InitializeHistory { file: file.clone() })),
            None,
            None,
        );
        Ok(Self { file, access })
    }

    fn read_all(&self) -> Result<BTreeMap<String, PreviousExecutionState>> {
        match fs::read(&self.file) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(states) => Ok(states),
                Err(err) => {
                    warn!(file = %self.file.display(), error = %err, "Discarding unreadable execution history");
                    Ok(BTreeMap::new())
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn update(&self, action: impl FnOnce(&mut BTreeMap<String, PreviousExecutionState>)) -> Result<()> {
        self.access.with_file_lock(|| -> Result<()> {
            let mut states = self.read_all()?;
            action(&mut states);
            atomic_write(&self.file, &serde_json::to_vec(&states)?)
        })?
    }
}

impl ExecutionHistoryStore for PersistentExecutionHistoryStore {
    fn load(&self, identity: &str) -> Result<Option<PreviousExecutionState>> {
        self.access
            .with_file_lock(|| self.read_all().map(|mut states| states.remove(identity)))?
    }

    fn store(&self, identity: &str, state: PreviousExecutionState) -> Result<()> {
        self.update(|states| {
            let _ = states.insert(identity.to_string(), state);
        })
    }

    fn remove(&self, identity: &str) -> Result<()> {
        self.update(|states| {
            let _ = states.remove(identity);
        })
    }
}
