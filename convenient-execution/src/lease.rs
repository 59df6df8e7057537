//! Worker leases.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use tracing::debug;

/// Bounds how many threads coordinate builds at the same time.
///
/// A thread takes a lease for the whole time it drives a graph; the graph's
/// own worker pool is sized separately by the engine configuration.
pub struct WorkerLeaseService {
    max_leases: usize,
    active: Mutex<usize>,
    released: Condvar,
}

impl fmt::Debug for WorkerLeaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLeaseService")
            .field("max_leases", &self.max_leases)
            .field("active", &*self.active.lock())
            .finish()
    }
}

/// A held lease, returned on drop.
#[must_use = "the lease is returned when dropped"]
pub struct WorkerLease<'a> {
    service: &'a WorkerLeaseService,
}

impl Drop for WorkerLease<'_> {
    fn drop(&mut self) {
        let mut active = self.service.active.lock();
        *active -= 1;
        let _ = self.service.released.notify_one();
    }
}

impl WorkerLeaseService {
    /// Service handing out at most `max_leases` leases (at least one).
    #[must_use]
    pub fn new(max_leases: usize) -> Self {
        Self {
            max_leases: max_leases.max(1),
            active: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Maximum number of concurrent leases.
    #[must_use]
    pub fn max_leases(&self) -> usize {
        self.max_leases
    }

    /// Leases currently held.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        *self.active.lock()
    }

    /// Block until a lease is free and take it.
    pub fn acquire(&self) -> WorkerLease<'_> {
        let mut active = self.active.lock();
        while *active >= self.max_leases {
            debug!(max = self.max_leases, "Waiting for a worker lease");
            self.released.wait(&mut active);
        }
        *active += 1;
        WorkerLease { service: self }
    }

    /// Run `action` while holding a lease.
    pub fn run_as_worker_thread<T>(&self, action: impl FnOnce() -> T) -> T {
        let _lease = self.acquire();
        action()
    }
}

impl Default for WorkerLeaseService {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_leases_are_bounded() {
        let service = Arc::new(WorkerLeaseService::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..6)
            .map(|_| {
                let service = Arc::clone(&service);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    service.run_as_worker_thread(|| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        let _ = peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        let _ = running.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(service.active_leases(), 0);
    }

    #[test]
    fn test_zero_is_raised_to_one() {
        let service = WorkerLeaseService::new(0);
        assert_eq!(service.max_leases(), 1);
        assert_eq!(service.run_as_worker_thread(|| 7), 7);
    }
}
