//! Lock manager and the locks it hands out.

use crate::access::LockFileAccess;
use crate::backoff::{AwaitableFileLockReleasedSignal, ExponentialBackoff, IoQuery};
use crate::contention::{ContendedAction, FileLockContentionHandler};
use crate::error::{FileLockError, Result};
use crate::info::LockInfo;
use crate::state::{
    DefaultLockStateSerializer, LockState, LockStateSerializer, Version1LockStateSerializer,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default time to wait for a lock held by somebody else.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Time to wait for the information region, which is only held briefly.
const SHORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type actions run under a lock may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How a lock is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers only; any number may hold it.
    Shared,
    /// A single reader and writer.
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// How to lock a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Requested mode.
    pub mode: LockMode,
    /// Use the state format older processes understand. Such locks cannot
    /// tell whether the target changed since they last saw it.
    pub use_cross_version_implementation: bool,
}

impl LockOptions {
    /// Options for `mode` with the current state format.
    #[must_use]
    pub fn mode(mode: LockMode) -> Self {
        Self {
            mode,
            use_cross_version_implementation: false,
        }
    }

    /// Switch to the cross-version state format.
    #[must_use]
    pub fn use_cross_version_implementation(self) -> Self {
        Self {
            use_cross_version_implementation: true,
            ..self
        }
    }
}

/// Identifies this process in lock information.
pub trait ProcessMetaDataProvider: Send + Sync {
    /// Process id as shown to other processes.
    fn process_identifier(&self) -> String;
}

/// Reports the OS process id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProcessMetaDataProvider;

impl ProcessMetaDataProvider for DefaultProcessMetaDataProvider {
    fn process_identifier(&self) -> String {
        std::process::id().to_string()
    }
}

/// Source of lock ids.
pub trait IdGenerator: Send + Sync {
    /// A fresh id.
    fn generate_id(&self) -> u64;
}

/// Random 64-bit ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate_id(&self) -> u64 {
        rand::random()
    }
}

/// Lock file guarding `target`: `<dir>/<dir name>.lock` for a directory,
/// `<parent>/<file name>.lock` for anything else.
#[must_use]
pub fn lock_file_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lock_name = format!("{name}.lock");
    if target.is_dir() {
        target.join(lock_name)
    } else {
        target
            .parent()
            .map_or_else(|| PathBuf::from(&lock_name), |parent| parent.join(&lock_name))
    }
}

struct ManagerInner {
    locked_files: Mutex<HashSet<PathBuf>>,
    metadata: Arc<dyn ProcessMetaDataProvider>,
    ids: Arc<dyn IdGenerator>,
    contention: Arc<dyn FileLockContentionHandler>,
    lock_timeout: Duration,
}

/// Hands out cross-process locks on files and directories.
///
/// Each target has a lock file next to it with two regions: the state
/// region, locked for as long as the lock is held, and the information
/// region, locked briefly to publish or read the owner's details. A process
/// may hold one lock per target; a second attempt is a programming error.
#[derive(Clone)]
pub struct FileLockManager {
    inner: Arc<ManagerInner>,
}

impl FileLockManager {
    /// Manager waiting up to `lock_timeout` for locks held elsewhere.
    #[must_use]
    pub fn new(
        metadata: Arc<dyn ProcessMetaDataProvider>,
        lock_timeout: Duration,
        contention: Arc<dyn FileLockContentionHandler>,
    ) -> Self {
        Self::with_id_generator(metadata, lock_timeout, contention, Arc::new(RandomIdGenerator))
    }

    /// Like [`FileLockManager::new`] with a custom lock id source.
    #[must_use]
    pub fn with_id_generator(
        metadata: Arc<dyn ProcessMetaDataProvider>,
        lock_timeout: Duration,
        contention: Arc<dyn FileLockContentionHandler>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                locked_files: Mutex::new(HashSet::new()),
                metadata,
                ids,
                contention,
                lock_timeout,
            }),
        }
    }

    /// Lock `target`, waiting for other processes to release it.
    ///
    /// `when_contended` runs when another process asks for the lock; it is
    /// expected to close the lock soon and trigger the signal it is given.
    ///
    /// # Errors
    ///
    /// Returns `FileLockError::AlreadyLocked` if this manager already holds
    /// a lock on `target`, `FileLockError::Timeout` if the lock could not be
    /// acquired in time, and propagates lock file I/O failures.
    pub fn lock(
        &self,
        target: &Path,
        options: LockOptions,
        display_name: &str,
        operation: &str,
        when_contended: Option<ContendedAction>,
    ) -> Result<FileLock> {
        let canonical = fs::canonicalize(target).or_else(|_| std::path::absolute(target))?;
        if !self.inner.locked_files.lock().insert(canonical.clone()) {
            return Err(FileLockError::AlreadyLocked(display_name.to_string()));
        }
        let lock = self.inner.contention.reserve_port().and_then(|port| {
            FileLock::open(
                Arc::clone(&self.inner),
                canonical.clone(),
                options,
                display_name,
                operation,
                port,
                when_contended,
            )
        });
        if lock.is_err() {
            let _ = self.inner.locked_files.lock().remove(&canonical);
        }
        lock
    }

    /// Whether this manager currently holds a lock on `target`.
    #[must_use]
    pub fn is_locked(&self, target: &Path) -> bool {
        let canonical = fs::canonicalize(target)
            .or_else(|_| std::path::absolute(target))
            .unwrap_or_else(|_| target.to_path_buf());
        self.inner.locked_files.lock().contains(&canonical)
    }
}

/// A held lock on a target.
///
/// Dropping the lock closes it.
pub struct FileLock {
    manager: Arc<ManagerInner>,
    target: PathBuf,
    display_name: String,
    mode: LockMode,
    lock_id: u64,
    access: Option<LockFileAccess>,
    state: LockState,
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .field("lock_id", &self.lock_id)
            .field("open", &self.access.is_some())
            .finish_non_exhaustive()
    }
}

impl FileLock {
    fn open(
        manager: Arc<ManagerInner>,
        target: PathBuf,
        options: LockOptions,
        display_name: &str,
        operation: &str,
        port: Option<u16>,
        when_contended: Option<ContendedAction>,
    ) -> Result<Self> {
        let lock_id = manager.ids.generate_id();
        let lock_file = lock_file_for(&target);
        if let Some(parent) = lock_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let serializer: Box<dyn LockStateSerializer> = if options.use_cross_version_implementation {
            Box::new(Version1LockStateSerializer)
        } else {
            Box::new(DefaultLockStateSerializer)
        };
        let access = LockFileAccess::open(&lock_file, serializer)?;

        let has_action = when_contended.is_some();
        if let Some(action) = when_contended {
            manager.contention.start(lock_id, action);
        }
        let acquiring = Acquisition {
            manager: &manager,
            access: &access,
            display_name,
            operation,
            port,
            lock_id,
        };
        let state = match acquiring.lock(options.mode) {
            Ok(state) => state,
            Err(err) => {
                if has_action {
                    manager.contention.stop(lock_id);
                }
                return Err(err);
            }
        };
        Ok(Self {
            manager,
            target,
            display_name: display_name.to_string(),
            mode: options.mode,
            lock_id,
            access: Some(access),
            state,
        })
    }

    /// The locked target.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Whether `path` is this lock's lock file.
    #[must_use]
    pub fn is_lock_file(&self, path: &Path) -> bool {
        self.access.as_ref().is_some_and(|access| access.path() == path)
    }

    /// Mode the lock was acquired in.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether the previous owner finished its last write.
    ///
    /// # Errors
    ///
    /// Returns `FileLockError::Closed` after [`FileLock::close`].
    pub fn unlocked_cleanly(&self) -> Result<bool> {
        self.assert_open()?;
        Ok(!self.state.is_dirty())
    }

    /// Current state of the lock file.
    ///
    /// # Errors
    ///
    /// Returns `FileLockError::Closed` after [`FileLock::close`].
    pub fn state(&self) -> Result<LockState> {
        self.assert_open()?;
        Ok(self.state)
    }

    /// Read the protected file with `action`.
    ///
    /// # Errors
    ///
    /// Returns `FileLockError::IntegrityViolation` if the last write did
    /// not finish, including for a target never written at all.
    pub fn read_file<T>(&self, action: impl FnOnce() -> T) -> Result<T> {
        self.assert_open_and_integral()?;
        Ok(action())
    }

    /// Modify a protected file whose current content must be intact.
    ///
    /// # Errors
    ///
    /// As [`FileLock::read_file`] and [`FileLock::write_file`].
    pub fn update_file<T, E>(&mut self, action: impl FnOnce() -> std::result::Result<T, E>) -> Result<T>
    where
        E: Into<BoxError>,
    {
        self.assert_open_and_integral()?;
        self.do_write_action(action)
    }

    /// Replace the protected file regardless of its current content.
    ///
    /// The state is marked dirty before `action` runs and clean after it
    /// succeeds; if it fails the state stays dirty.
    ///
    /// # Errors
    ///
    /// Returns `FileLockError::InsufficientLockMode` for a shared lock and
    /// `FileLockError::Action` if `action` fails.
    pub fn write_file<T, E>(&mut self, action: impl FnOnce() -> std::result::Result<T, E>) -> Result<T>
    where
        E: Into<BoxError>,
    {
        self.assert_open()?;
        self.do_write_action(action)
    }

    fn do_write_action<T, E>(&mut self, action: impl FnOnce() -> std::result::Result<T, E>) -> Result<T>
    where
        E: Into<BoxError>,
    {
        if self.mode != LockMode::Exclusive {
            return Err(FileLockError::InsufficientLockMode);
        }
        let access = self.access.as_ref().ok_or(FileLockError::Closed)?;
        let dirty = self.state.mark_dirty();
        access.write_state(&dirty)?;
        self.state = dirty;

        let value = action().map_err(|e| FileLockError::Action(self.display_name.clone(), e.into()))?;

        let clean = self.state.mark_clean();
        access.write_state(&clean)?;
        self.state = clean;
        Ok(value)
    }

    fn assert_open(&self) -> Result<()> {
        if self.access.is_some() {
            Ok(())
        } else {
            Err(FileLockError::Closed)
        }
    }

    fn assert_open_and_integral(&self) -> Result<()> {
        self.assert_open()?;
        if self.state.is_dirty() {
            return Err(FileLockError::IntegrityViolation(self.target.clone()));
        }
        Ok(())
    }

    /// Release the lock. Closing twice is a no-op.
    ///
    /// An exclusive owner clears the information region first. The OS lock
    /// is released even if that fails.
    ///
    /// # Errors
    ///
    /// Propagates the failure to clear the information region.
    pub fn close(&mut self) -> Result<()> {
        let Some(access) = self.access.take() else {
            return Ok(());
        };
        debug!(target = %self.display_name, "Releasing lock");
        let cleared = if self.mode == LockMode::Exclusive {
            clear_information_region(&access)
        } else {
            Ok(())
        };
        drop(access);
        self.manager.contention.stop(self.lock_id);
        let _ = self.manager.locked_files.lock().remove(&self.target);
        cleared
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(target = %self.display_name, error = %err, "Failed to release lock cleanly");
        }
    }
}

fn clear_information_region(access: &LockFileAccess) -> Result<()> {
    let signal = AwaitableFileLockReleasedSignal::default();
    let backoff = ExponentialBackoff::new(SHORT_TIMEOUT, &signal);
    let outcome = backoff.retry_until(|| {
        Ok(if access.try_lock_info(false)? {
            IoQuery::Successful(())
        } else {
            IoQuery::NotSuccessful(())
        })
    })?;
    if !outcome.is_successful() {
        return Ok(());
    }
    let cleared = access.clear_lock_info();
    access.unlock_info()?;
    cleared
}

/// One attempt to lock a lock file.
struct Acquisition<'a> {
    manager: &'a ManagerInner,
    access: &'a LockFileAccess,
    display_name: &'a str,
    operation: &'a str,
    port: Option<u16>,
    lock_id: u64,
}

impl Acquisition<'_> {
    fn lock(&self, mode: LockMode) -> Result<LockState> {
        debug!(target = self.display_name, %mode, "Waiting to acquire lock");
        let signal = Arc::new(AwaitableFileLockReleasedSignal::default());
        if !self.lock_state_region(mode, &signal)? {
            let info = self.read_information_region(&ExponentialBackoff::new(SHORT_TIMEOUT, &signal))?;
            return Err(self.timeout(&info));
        }
        // On failure the caller drops the handle, which releases the state region.
        self.after_state_locked(mode, &signal)
    }

    fn after_state_locked(
        &self,
        mode: LockMode,
        signal: &AwaitableFileLockReleasedSignal,
    ) -> Result<LockState> {
        let state = match mode {
            LockMode::Exclusive => {
                let state = self.access.ensure_lock_state()?;
                let backoff = ExponentialBackoff::new(SHORT_TIMEOUT, signal);
                let outcome = backoff.retry_until(|| {
                    Ok(if self.access.try_lock_info(false)? {
                        IoQuery::Successful(())
                    } else {
                        IoQuery::NotSuccessful(())
                    })
                })?;
                if !outcome.is_successful() {
                    return Err(FileLockError::Timeout {
                        message: format!(
                            "Unable to lock the information region for {}",
                            self.display_name
                        ),
                        lock_file: self.access.path().to_path_buf(),
                    });
                }
                let info = LockInfo {
                    port: self.port,
                    lock_id: self.lock_id,
                    pid: self.manager.metadata.process_identifier(),
                    operation: self.operation.to_string(),
                };
                let written = self.access.write_lock_info(&info);
                self.access.unlock_info()?;
                written?;
                state
            }
            LockMode::Shared => self.access.read_lock_state()?,
        };
        debug!(target = self.display_name, "Lock acquired");
        Ok(state)
    }

    /// Poll the state region, pinging the owner while waiting.
    fn lock_state_region(
        &self,
        mode: LockMode,
        signal: &Arc<AwaitableFileLockReleasedSignal>,
    ) -> Result<bool> {
        let backoff = ExponentialBackoff::new(self.manager.lock_timeout, signal);
        let mut last_owner_port = None;
        let mut last_ping = Duration::ZERO;
        let outcome = backoff.retry_until(|| {
            if self.access.try_lock_state(mode == LockMode::Shared)? {
                return Ok(IoQuery::Successful(()));
            }
            if self.port.is_none() {
                return Ok(IoQuery::NotSuccessful(()));
            }
            let info = self.read_information_region(&backoff)?;
            let Some(owner_port) = info.port else {
                debug!(
                    target = self.display_name,
                    "Lock is held by another process that does not listen for lock requests"
                );
                return Ok(IoQuery::NotSuccessful(()));
            };
            if last_owner_port != Some(owner_port) {
                // A new owner gets a fresh timeout.
                backoff.restart_timer();
                last_owner_port = Some(owner_port);
                last_ping = Duration::ZERO;
            }
            let since_last_ping = backoff.elapsed().saturating_sub(last_ping);
            if self.manager.contention.maybe_ping_owner(
                owner_port,
                info.lock_id,
                self.display_name,
                since_last_ping,
                signal,
            ) {
                last_ping = backoff.elapsed();
                debug!(
                    target = self.display_name,
                    owner_pid = %info.pid,
                    lock_id = info.lock_id,
                    port = owner_port,
                    "Lock is held by another process, pinged owner"
                );
            }
            Ok(IoQuery::NotSuccessful(()))
        })?;
        Ok(outcome.is_successful())
    }

    fn read_information_region(&self, backoff: &ExponentialBackoff<'_>) -> Result<LockInfo> {
        let outcome = backoff.retry_until(|| {
            Ok(if self.access.try_lock_info(true)? {
                IoQuery::Successful(())
            } else {
                IoQuery::NotSuccessful(())
            })
        })?;
        if !outcome.is_successful() {
            debug!(target = self.display_name, "Could not lock information region, ignoring");
            return Ok(LockInfo::default());
        }
        let info = self.access.read_lock_info();
        self.access.unlock_info()?;
        // An owner may be halfway through writing its details.
        Ok(info.unwrap_or_default())
    }

    fn timeout(&self, owner: &LockInfo) -> FileLockError {
        let ours = self.manager.metadata.process_identifier();
        let lock_file = self.access.path().to_path_buf();
        let message = if owner.pid == ours {
            format!(
                "Timeout waiting to lock {}. It is currently in use by this process.\nOwner Operation: {}\nOur operation: {}\nLock file: {}",
                self.display_name,
                owner.operation,
                self.operation,
                lock_file.display()
            )
        } else {
            format!(
                "Timeout waiting to lock {}. It is currently in use by another process.\nOwner PID: {}\nOur PID: {}\nOwner Operation: {}\nOur operation: {}\nLock file: {}",
                self.display_name,
                owner.pid,
                ours,
                owner.operation,
                self.operation,
                lock_file.display()
            )
        };
        FileLockError::Timeout { message, lock_file }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contention::NoOpContentionHandler;
    use tempfile::TempDir;

    fn manager(timeout: Duration) -> FileLockManager {
        FileLockManager::new(
            Arc::new(DefaultProcessMetaDataProvider),
            timeout,
            Arc::new(NoOpContentionHandler),
        )
    }

    #[test]
    fn test_lock_file_placement() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache");
        fs::create_dir(&cache).unwrap();
        assert_eq!(lock_file_for(&cache), cache.join("cache.lock"));
        let file = dir.path().join("history.bin");
        assert_eq!(lock_file_for(&file), dir.path().join("history.bin.lock"));
    }

    #[test]
    fn test_double_lock_in_process_fails() {
        let dir = TempDir::new().unwrap();
        let manager = manager(DEFAULT_LOCK_TIMEOUT);
        let options = LockOptions::mode(LockMode::Exclusive);
        let _lock = manager.lock(dir.path(), options, "cache", "", None).unwrap();
        assert!(manager.is_locked(dir.path()));

        let err = manager.lock(dir.path(), options, "cache", "", None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot lock cache as it has already been locked by this process."
        );
    }

    #[test]
    fn test_fresh_lock_requires_write_before_read() {
        let dir = TempDir::new().unwrap();
        let manager = manager(DEFAULT_LOCK_TIMEOUT);
        let mut lock = manager
            .lock(dir.path(), LockOptions::mode(LockMode::Exclusive), "cache", "", None)
            .unwrap();
        assert!(lock.state().unwrap().is_in_initial_state());
        assert!(!lock.unlocked_cleanly().unwrap());
        assert!(matches!(
            lock.read_file(|| ()),
            Err(FileLockError::IntegrityViolation(_))
        ));

        lock.write_file(|| Ok::<_, BoxError>(())).unwrap();
        assert_eq!(lock.read_file(|| 5).unwrap(), 5);
        lock.update_file(|| Ok::<_, BoxError>(())).unwrap();
        assert!(lock.unlocked_cleanly().unwrap());
    }

    #[test]
    fn test_failed_write_leaves_state_dirty() {
        let dir = TempDir::new().unwrap();
        let manager = manager(DEFAULT_LOCK_TIMEOUT);
        let options = LockOptions::mode(LockMode::Exclusive);
        let mut lock = manager.lock(dir.path(), options, "cache", "", None).unwrap();
        lock.write_file(|| Ok::<_, BoxError>(())).unwrap();

        let err = lock
            .update_file(|| Err::<(), BoxError>("disk full".into()))
            .unwrap_err();
        assert!(matches!(err, FileLockError::Action(..)));
        lock.close().unwrap();

        let lock = manager.lock(dir.path(), options, "cache", "", None).unwrap();
        assert!(!lock.unlocked_cleanly().unwrap());
    }

    #[test]
    fn test_shared_lock_cannot_write() {
        let dir = TempDir::new().unwrap();
        let manager = manager(DEFAULT_LOCK_TIMEOUT);
        let mut lock = manager
            .lock(dir.path(), LockOptions::mode(LockMode::Shared), "cache", "", None)
            .unwrap();
        assert_eq!(lock.mode(), LockMode::Shared);
        assert!(matches!(
            lock.write_file(|| Ok::<_, BoxError>(())),
            Err(FileLockError::InsufficientLockMode)
        ));
    }

    #[test]
    fn test_closed_lock_rejects_use() {
        let dir = TempDir::new().unwrap();
        let manager = manager(DEFAULT_LOCK_TIMEOUT);
        let mut lock = manager
            .lock(dir.path(), LockOptions::mode(LockMode::Exclusive), "cache", "", None)
            .unwrap();
        lock.close().unwrap();
        lock.close().unwrap();
        assert!(!manager.is_locked(dir.path()));
        assert!(matches!(lock.state(), Err(FileLockError::Closed)));
    }

    #[test]
    fn test_timeout_names_owner_and_operations() {
        let dir = TempDir::new().unwrap();
        let owner = manager(DEFAULT_LOCK_TIMEOUT);
        let waiter = manager(Duration::from_millis(200));
        let options = LockOptions::mode(LockMode::Exclusive);
        let _held = owner
            .lock(dir.path(), options, "cache", "compiling", None)
            .unwrap();

        let err = waiter
            .lock(dir.path(), options, "cache", "testing", None)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Timeout waiting to lock cache."));
        assert!(message.contains("this process"));
        assert!(message.contains("Owner Operation: compiling"));
        assert!(message.contains("Our operation: testing"));
        assert!(!waiter.is_locked(dir.path()));
    }

    #[test]
    fn test_cross_version_lock_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = manager(DEFAULT_LOCK_TIMEOUT);
        let options = LockOptions::mode(LockMode::Exclusive).use_cross_version_implementation();
        let mut lock = manager.lock(dir.path(), options, "cache", "", None).unwrap();
        lock.write_file(|| Ok::<_, BoxError>(())).unwrap();
        lock.close().unwrap();

        let lock = manager.lock(dir.path(), options, "cache", "", None).unwrap();
        let state = lock.state().unwrap();
        assert!(!state.is_dirty());
        assert!(!state.can_detect_changes());
    }
}
