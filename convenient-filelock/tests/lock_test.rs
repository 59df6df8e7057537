//! Locking behaviour between processes. Each `FileLockManager` holds its own
//! lock file handles, so two managers stand in for two processes.

use convenient_filelock::{
    BoxError, DEFAULT_LOCK_TIMEOUT, DefaultFileLockContentionHandler,
    DefaultProcessMetaDataProvider, FileLockError, FileLockManager, LockMode,
    LockOnDemandCacheAccess, LockOptions, NoOpContentionHandler,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn process(timeout: Duration) -> FileLockManager {
    FileLockManager::new(
        Arc::new(DefaultProcessMetaDataProvider),
        timeout,
        Arc::new(NoOpContentionHandler),
    )
}

fn pingable_process(timeout: Duration) -> FileLockManager {
    FileLockManager::new(
        Arc::new(DefaultProcessMetaDataProvider),
        timeout,
        Arc::new(DefaultFileLockContentionHandler::new()),
    )
}

fn exclusive() -> LockOptions {
    LockOptions::mode(LockMode::Exclusive)
}

#[test]
fn test_second_process_waits_for_release() {
    let dir = TempDir::new().unwrap();
    let first = process(DEFAULT_LOCK_TIMEOUT);
    let second = process(Duration::from_secs(10));
    let released = Arc::new(AtomicBool::new(false));

    let mut held = first.lock(dir.path(), exclusive(), "cache", "first", None).unwrap();
    let waiter = {
        let target = dir.path().to_path_buf();
        let released = Arc::clone(&released);
        thread::spawn(move || {
            let lock = second.lock(&target, exclusive(), "cache", "second", None).unwrap();
            assert!(released.load(Ordering::SeqCst));
            drop(lock);
        })
    };

    thread::sleep(Duration::from_millis(300));
    released.store(true, Ordering::SeqCst);
    held.close().unwrap();
    waiter.join().unwrap();
}

#[test]
fn test_at_most_one_exclusive_owner_at_a_time() {
    let dir = TempDir::new().unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let target = dir.path().to_path_buf();
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            thread::spawn(move || {
                let manager = process(Duration::from_secs(30));
                for _ in 0..5 {
                    let lock = manager
                        .lock(&target, exclusive(), "cache", &format!("worker {n}"), None)
                        .unwrap();
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        let _ = overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(5));
                    let _ = inside.fetch_sub(1, Ordering::SeqCst);
                    drop(lock);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn test_shared_locks_coexist_and_block_writers() {
    let dir = TempDir::new().unwrap();
    let reader_a = process(DEFAULT_LOCK_TIMEOUT);
    let reader_b = process(DEFAULT_LOCK_TIMEOUT);
    let writer = process(Duration::from_millis(200));
    let shared = LockOptions::mode(LockMode::Shared);

    let _a = reader_a.lock(dir.path(), shared, "cache", "", None).unwrap();
    let _b = reader_b.lock(dir.path(), shared, "cache", "", None).unwrap();
    assert!(matches!(
        writer.lock(dir.path(), exclusive(), "cache", "", None),
        Err(FileLockError::Timeout { .. })
    ));
}

#[test]
fn test_crash_mid_update_is_detected() {
    let dir = TempDir::new().unwrap();
    let crashed = process(DEFAULT_LOCK_TIMEOUT);
    let mut lock = crashed.lock(dir.path(), exclusive(), "cache", "", None).unwrap();
    lock.write_file(|| Ok::<_, BoxError>(())).unwrap();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        lock.update_file(|| -> Result<(), BoxError> { panic!("process died mid-write") })
    }));
    assert!(outcome.is_err());
    drop(lock);

    let next = process(DEFAULT_LOCK_TIMEOUT);
    let mut lock = next.lock(dir.path(), exclusive(), "cache", "", None).unwrap();
    assert!(!lock.unlocked_cleanly().unwrap());
    assert!(matches!(
        lock.read_file(|| ()),
        Err(FileLockError::IntegrityViolation(_))
    ));
    assert!(matches!(
        lock.update_file(|| Ok::<_, BoxError>(())),
        Err(FileLockError::IntegrityViolation(_))
    ));

    // rewriting from scratch restores integrity
    lock.write_file(|| Ok::<_, BoxError>(())).unwrap();
    assert!(lock.unlocked_cleanly().unwrap());
}

#[test]
fn test_idle_owner_releases_when_pinged() {
    let dir = TempDir::new().unwrap();
    let owner = LockOnDemandCacheAccess::new(
        "cache",
        dir.path(),
        exclusive(),
        pingable_process(DEFAULT_LOCK_TIMEOUT),
    );
    owner.with_file_lock(|| ()).unwrap();
    assert!(owner.is_locked());

    let requester = pingable_process(Duration::from_secs(20));
    let started = Instant::now();
    let lock = requester
        .lock(dir.path(), exclusive(), "cache", "requesting", None)
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!owner.is_locked());
    drop(lock);
}

#[test]
fn test_busy_owner_releases_after_current_use() {
    let dir = TempDir::new().unwrap();
    let owner = LockOnDemandCacheAccess::new(
        "cache",
        dir.path(),
        exclusive(),
        pingable_process(DEFAULT_LOCK_TIMEOUT),
    );
    let acquired = Arc::new(AtomicBool::new(false));

    let guard = owner.acquire_file_lock().unwrap();
    let requester = {
        let target = dir.path().to_path_buf();
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            let manager = pingable_process(Duration::from_secs(20));
            let lock = manager.lock(&target, exclusive(), "cache", "", None).unwrap();
            acquired.store(true, Ordering::SeqCst);
            drop(lock);
        })
    };

    thread::sleep(Duration::from_millis(500));
    assert!(owner.is_locked());
    assert!(!acquired.load(Ordering::SeqCst));

    drop(guard);
    requester.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert!(!owner.is_locked());
}
