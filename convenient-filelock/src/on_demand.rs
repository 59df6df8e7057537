//! Cross-process cache access that holds the lock only while needed.

use crate::contention::{ContendedAction, FileLockReleasedSignal};
use crate::error::{FileLockError, Result};
use crate::manager::{BoxError, FileLock, FileLockManager, LockOptions};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Prepares a cache the first time it is locked.
pub trait CacheInitializationAction: Send + Sync {
    /// Whether the cache behind `lock` needs initializing.
    fn requires_initialization(&self, lock: &FileLock) -> bool;

    /// Initialize the cache; runs as a write under the lock.
    ///
    /// # Errors
    ///
    /// Any failure leaves the lock state dirty.
    fn initialize(&self) -> std::result::Result<(), BoxError>;
}

/// Called with the lock right after it was acquired or right before it is
/// released.
pub type LockHook = Box<dyn Fn(&FileLock) + Send + Sync>;

#[derive(Default)]
struct AccessState {
    count: usize,
    lock: Option<FileLock>,
    release_signal: Option<Arc<dyn FileLockReleasedSignal>>,
}

struct AccessInner {
    display_name: String,
    target: PathBuf,
    options: LockOptions,
    manager: FileLockManager,
    init: Option<Box<dyn CacheInitializationAction>>,
    on_open: Option<LockHook>,
    on_close: Option<LockHook>,
    state: Mutex<AccessState>,
}

/// Reference-counted use of a cross-process lock.
///
/// The file lock is acquired when the first in-process user arrives and
/// then kept, so a burst of operations pays for locking once. When another
/// process asks for the lock it is released right away if nobody in this
/// process uses it, or as soon as the last current user is done.
pub struct LockOnDemandCacheAccess {
    inner: Arc<AccessInner>,
}

impl fmt::Debug for LockOnDemandCacheAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockOnDemandCacheAccess")
            .field("display_name", &self.inner.display_name)
            .field("target", &self.inner.target)
            .finish_non_exhaustive()
    }
}

impl LockOnDemandCacheAccess {
    /// Access to `target` locked through `manager` with `options`.
    #[must_use]
    pub fn new(
        display_name: impl Into<String>,
        target: impl Into<PathBuf>,
        options: LockOptions,
        manager: FileLockManager,
    ) -> Self {
        Self::with_hooks(display_name, target, options, manager, None, None, None)
    }

    /// Like [`LockOnDemandCacheAccess::new`] with an initialization action
    /// and open/close hooks. Hooks run while no other in-process user can
    /// acquire or release the lock.
    #[must_use]
    pub fn with_hooks(
        display_name: impl Into<String>,
        target: impl Into<PathBuf>,
        options: LockOptions,
        manager: FileLockManager,
        init: Option<Box<dyn CacheInitializationAction>>,
        on_open: Option<LockHook>,
        on_close: Option<LockHook>,
    ) -> Self {
        Self {
            inner: Arc::new(AccessInner {
                display_name: display_name.into(),
                target: target.into(),
                options,
                manager,
                init,
                on_open,
                on_close,
                state: Mutex::new(AccessState::default()),
            }),
        }
    }

    /// Run `action` while holding the file lock.
    ///
    /// # Errors
    ///
    /// Propagates failures to acquire the lock or initialize the cache.
    pub fn with_file_lock<T>(&self, action: impl FnOnce() -> T) -> Result<T> {
        let _guard = self.acquire_file_lock()?;
        Ok(action())
    }

    /// Hold the file lock until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// As [`LockOnDemandCacheAccess::with_file_lock`].
    pub fn acquire_file_lock(&self) -> Result<FileLockGuard<'_>> {
        self.inner.increment_lock_count()?;
        Ok(FileLockGuard { access: self })
    }

    /// Whether the file lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().lock.is_some()
    }

    /// Release the file lock.
    ///
    /// # Errors
    ///
    /// Returns `FileLockError::CacheInUse` while users still hold the lock.
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.count != 0 {
            return Err(FileLockError::CacheInUse {
                name: self.inner.display_name.clone(),
                count: state.count,
            });
        }
        self.inner.release_lock_if_held(&mut state)
    }
}

/// One in-process use of the lock; dropping it ends the use.
#[must_use = "the lock is released for this user when the guard is dropped"]
pub struct FileLockGuard<'a> {
    access: &'a LockOnDemandCacheAccess,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.access.inner.decrement_lock_count() {
            warn!(cache = %self.access.inner.display_name, error = %err, "Failed to release cache lock");
        }
    }
}

impl AccessInner {
    fn increment_lock_count(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.lock.is_none() {
            if state.count != 0 {
                return Err(FileLockError::MismatchedLockCount);
            }
            debug!(cache = %self.display_name, "Acquiring file lock");
            let mut lock = self.manager.lock(
                &self.target,
                self.options,
                &self.display_name,
                "",
                Some(self.contended_action()),
            )?;
            if let Err(err) = self.open(&mut lock) {
                let _ = lock.close();
                return Err(err);
            }
            state.lock = Some(lock);
        }
        state.count += 1;
        Ok(())
    }

    fn open(&self, lock: &mut FileLock) -> Result<()> {
        if let Some(init) = &self.init
            && init.requires_initialization(lock)
        {
            lock.write_file(|| init.initialize())?;
        }
        if let Some(on_open) = &self.on_open {
            on_open(lock);
        }
        Ok(())
    }

    fn decrement_lock_count(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.count == 0 || state.lock.is_none() {
            return Err(FileLockError::MismatchedLockCount);
        }
        state.count -= 1;
        if state.count == 0 && state.release_signal.is_some() {
            self.release_lock_if_held(&mut state)?;
        }
        Ok(())
    }

    fn release_lock_if_held(&self, state: &mut AccessState) -> Result<()> {
        let Some(mut lock) = state.lock.take() else {
            return Ok(());
        };
        debug!(cache = %self.display_name, "Releasing file lock");
        if let Some(on_close) = &self.on_close {
            on_close(&lock);
        }
        let closed = lock.close();
        if let Some(signal) = state.release_signal.take() {
            signal.trigger();
        }
        closed
    }

    fn contended_action(self: &Arc<Self>) -> ContendedAction {
        let inner: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |signal: Arc<dyn FileLockReleasedSignal>| {
            let Some(inner) = inner.upgrade() else {
                signal.trigger();
                return;
            };
            let mut state = inner.state.lock();
            if state.count == 0 {
                debug!(cache = %inner.display_name, "Lock requested by another process, releasing");
                if let Err(err) = inner.release_lock_if_held(&mut state) {
                    warn!(cache = %inner.display_name, error = %err, "Failed to release contended lock");
                }
                signal.trigger();
            } else {
                debug!(
                    cache = %inner.display_name,
                    users = state.count,
                    "Lock requested by another process, releasing when the current operations complete"
                );
                state.release_signal = Some(signal);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contention::NoOpContentionHandler;
    use crate::manager::{DEFAULT_LOCK_TIMEOUT, DefaultProcessMetaDataProvider, LockMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn manager() -> FileLockManager {
        FileLockManager::new(
            Arc::new(DefaultProcessMetaDataProvider),
            DEFAULT_LOCK_TIMEOUT,
            Arc::new(NoOpContentionHandler),
        )
    }

    struct CountingInit(Arc<AtomicUsize>);

    impl CacheInitializationAction for CountingInit {
        fn requires_initialization(&self, lock: &FileLock) -> bool {
            lock.state().is_ok_and(|state| state.is_in_initial_state())
        }

        fn initialize(&self) -> std::result::Result<(), BoxError> {
            let _ = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_lock_is_kept_between_uses() {
        let dir = TempDir::new().unwrap();
        let access = LockOnDemandCacheAccess::new(
            "cache",
            dir.path(),
            LockOptions::mode(LockMode::Exclusive),
            manager(),
        );
        assert!(!access.is_locked());
        assert_eq!(access.with_file_lock(|| 1).unwrap(), 1);
        assert!(access.is_locked());
        access.close().unwrap();
        assert!(!access.is_locked());
    }

    #[test]
    fn test_close_while_in_use_fails() {
        let dir = TempDir::new().unwrap();
        let access = LockOnDemandCacheAccess::new(
            "cache",
            dir.path(),
            LockOptions::mode(LockMode::Exclusive),
            manager(),
        );
        let guard = access.acquire_file_lock().unwrap();
        let err = access.close().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot close cache access for cache as it is currently in use for 1 operations."
        );
        drop(guard);
        access.close().unwrap();
    }

    #[test]
    fn test_initialization_runs_once_with_hooks() {
        let dir = TempDir::new().unwrap();
        let initialized = Arc::new(AtomicUsize::new(0));
        let opened = Arc::new(AtomicUsize::new(0));
        let hook: LockHook = {
            let opened = Arc::clone(&opened);
            Box::new(move |_lock: &FileLock| {
                let _ = opened.fetch_add(1, Ordering::SeqCst);
            })
        };
        let access = LockOnDemandCacheAccess::with_hooks(
            "cache",
            dir.path(),
            LockOptions::mode(LockMode::Exclusive),
            manager(),
            Some(Box::new(CountingInit(Arc::clone(&initialized)))),
            Some(hook),
            None,
        );

        access.with_file_lock(|| ()).unwrap();
        access.close().unwrap();
        access.with_file_lock(|| ()).unwrap();

        assert_eq!(initialized.load(Ordering::SeqCst), 1);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[traced_test]
    fn test_contention_defers_release_until_idle() {
        let dir = TempDir::new().unwrap();
        let access = LockOnDemandCacheAccess::new(
            "cache",
            dir.path(),
            LockOptions::mode(LockMode::Exclusive),
            manager(),
        );
        let action = access.inner.contended_action();

        struct Flag(AtomicUsize);
        impl FileLockReleasedSignal for Flag {
            fn trigger(&self) {
                let _ = self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let released = Arc::new(Flag(AtomicUsize::new(0)));

        let guard = access.acquire_file_lock().unwrap();
        action(released.clone());
        assert!(access.is_locked());
        assert_eq!(released.0.load(Ordering::SeqCst), 0);
        assert!(logs_contain("releasing when the current operations complete"));

        drop(guard);
        assert!(!access.is_locked());
        assert_eq!(released.0.load(Ordering::SeqCst), 1);

        // idle: released immediately
        access.with_file_lock(|| ()).unwrap();
        action(released.clone());
        assert!(!access.is_locked());
        assert_eq!(released.0.load(Ordering::SeqCst), 2);
    }
}
