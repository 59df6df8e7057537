//! Randomized exponential backoff for lock polling.

use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::cell::Cell;
use std::time::{Duration, Instant};

const SLOT_TIME: Duration = Duration::from_millis(25);
const CAP_FACTOR: u32 = 100;

/// Outcome of one polling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoQuery<T> {
    /// Done, stop retrying.
    Successful(T),
    /// Try again after backing off.
    NotSuccessful(T),
}

impl<T> IoQuery<T> {
    /// Whether the query succeeded.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Successful(_))
    }

    /// The value of the last attempt.
    pub fn into_value(self) -> T {
        match self {
            Self::Successful(value) | Self::NotSuccessful(value) => value,
        }
    }
}

/// Wakes lock pollers early when the owner confirms a release.
///
/// A release triggered while nobody waits is kept for the next waiter, so a
/// confirmation arriving between two polls is not lost.
#[derive(Debug, Default)]
pub struct AwaitableFileLockReleasedSignal {
    state: Mutex<SignalState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct SignalState {
    waiting: usize,
    pending: bool,
}

impl AwaitableFileLockReleasedSignal {
    /// Block for up to `timeout`; returns whether the signal fired.
    pub fn await_release(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.pending {
            state.waiting += 1;
            let _ = self.released.wait_while_for(&mut state, |s| !s.pending, timeout);
            state.waiting -= 1;
        }
        std::mem::take(&mut state.pending)
    }

    /// Wake every waiting poller.
    pub fn trigger(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        let _ = self.released.notify_all();
    }

    /// Whether a poller is currently blocked on this signal.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting > 0
    }
}

/// Retries a query until it succeeds or a timeout expires.
///
/// Between attempts it waits a random number of slots, with the number of
/// slots growing exponentially up to a cap, or until the release signal
/// fires. The timer can be restarted while retrying, e.g. when the lock
/// changes hands.
pub struct ExponentialBackoff<'a> {
    timeout: Duration,
    started: Cell<Instant>,
    signal: &'a AwaitableFileLockReleasedSignal,
}

impl<'a> ExponentialBackoff<'a> {
    /// Backoff giving up after `timeout`, woken early by `signal`.
    #[must_use]
    pub fn new(timeout: Duration, signal: &'a AwaitableFileLockReleasedSignal) -> Self {
        Self {
            timeout,
            started: Cell::new(Instant::now()),
            signal,
        }
    }

    /// Time since start or the last restart.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.get().elapsed()
    }

    /// Start the timeout again from now.
    pub fn restart_timer(&self) {
        self.started.set(Instant::now());
    }

    /// The signal this backoff waits on.
    #[must_use]
    pub fn signal(&self) -> &'a AwaitableFileLockReleasedSignal {
        self.signal
    }

    /// Run `query` until it succeeds or the timeout expires; returns the
    /// last outcome either way.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `query`.
    pub fn retry_until<T>(&self, mut query: impl FnMut() -> Result<IoQuery<T>>) -> Result<IoQuery<T>> {
        let mut iteration = 0u32;
        loop {
            let outcome = query()?;
            if outcome.is_successful() || self.elapsed() >= self.timeout {
                return Ok(outcome);
            }
            iteration = iteration.saturating_add(1);
            let _ = self.signal.await_release(backoff_period_for(iteration));
        }
    }
}

fn backoff_period_for(iteration: u32) -> Duration {
    let slots = 1u32.checked_shl(iteration).unwrap_or(u32::MAX).min(CAP_FACTOR);
    SLOT_TIME * rand::thread_rng().gen_range(0..slots)
}
