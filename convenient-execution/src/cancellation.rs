//! Build cancellation.

use crate::error::PlanError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

/// Shared flag that asks a build to stop.
///
/// Cancellation is checked at well defined points (before populating the
/// graph, before starting execution). Nodes already running are not
/// interrupted; registered callbacks run once, on the cancelling thread.
#[derive(Clone, Default)]
pub struct BuildCancellationToken {
    state: Arc<TokenState>,
}

impl fmt::Debug for BuildCancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildCancellationToken")
            .field("cancelled", &self.is_cancellation_requested())
            .finish_non_exhaustive()
    }
}

/// Handle for removing a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(u64);

impl BuildCancellationToken {
    /// Token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation and run the callbacks. Later calls do nothing.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Build cancellation requested");
        let callbacks = std::mem::take(&mut *self.state.callbacks.lock());
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Run `callback` on cancellation, or right away if already cancelled.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) -> CallbackHandle {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut callbacks = self.state.callbacks.lock();
            if !self.is_cancellation_requested() {
                callbacks.push((id, Box::new(callback)));
                return CallbackHandle(id);
            }
        }
        callback();
        CallbackHandle(id)
    }

    /// Forget a callback; returns whether it was still registered.
    pub fn remove_callback(&self, handle: CallbackHandle) -> bool {
        let mut callbacks = self.state.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != handle.0);
        callbacks.len() != before
    }

    /// Fail with `PlanError::Cancelled` if cancellation was requested.
    ///
    /// # Errors
    ///
    /// `PlanError::Cancelled` once [`BuildCancellationToken::cancel`] ran.
    pub fn check(&self) -> Result<(), PlanError> {
        if self.is_cancellation_requested() {
            Err(PlanError::Cancelled)
        } else {
            Ok(())
        }
    }
}
