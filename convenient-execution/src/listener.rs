//! Typed listener broadcast.

use crate::error::BoxError;
use crate::plan::{ExecutionPlan, NodeState};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Notified around every task execution.
pub trait TaskExecutionListener: Send + Sync {
    /// A task is about to run.
    ///
    /// # Errors
    ///
    /// A failure is reported after every other listener was notified.
    fn before_execute(&self, _task: &str) -> Result<(), BoxError> {
        Ok(())
    }

    /// A task reached its final state.
    ///
    /// # Errors
    ///
    /// As [`TaskExecutionListener::before_execute`].
    fn after_execute(&self, _task: &str, _state: &NodeState) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Notified once the task graph is complete.
pub trait TaskExecutionGraphListener: Send + Sync {
    /// Every requested task and its dependencies are in `plan`.
    ///
    /// # Errors
    ///
    /// As [`TaskExecutionListener::before_execute`].
    fn graph_populated(&self, plan: &ExecutionPlan) -> Result<(), BoxError>;
}

/// One or more listeners failed while being notified.
#[derive(Debug, Error)]
#[error("Failed to notify {listener}.")]
pub struct ListenerNotificationError {
    listener: &'static str,
    #[source]
    failures: ListenerFailures,
}

impl ListenerNotificationError {
    /// Failures in listener registration order.
    #[must_use]
    pub fn failures(&self) -> &[BoxError] {
        &self.failures.0
    }
}

#[derive(Debug)]
struct ListenerFailures(Vec<BoxError>);

impl fmt::Display for ListenerFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join("; "))
    }
}

impl std::error::Error for ListenerFailures {}

/// Listeners of one type, notified in registration order.
///
/// Every listener is notified even if an earlier one fails; the failures
/// are reported together afterwards.
pub struct ListenerBroadcast<L: ?Sized> {
    name: &'static str,
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> fmt::Debug for ListenerBroadcast<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerBroadcast")
            .field("name", &self.name)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl<L: ?Sized> ListenerBroadcast<L> {
    /// Empty broadcast; `name` appears in notification failures.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<L>) {
        self.listeners.write().push(listener);
    }

    /// Unregister a listener by identity; returns whether it was found.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        listeners.len() != before
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Call `notify` for every listener.
    ///
    /// The listener list is copied first, so listeners may add or remove
    /// listeners while being notified.
    ///
    /// # Errors
    ///
    /// Returns every listener failure in one `ListenerNotificationError`.
    pub fn dispatch(
        &self,
        mut notify: impl FnMut(&L) -> Result<(), BoxError>,
    ) -> Result<(), ListenerNotificationError> {
        let listeners: Vec<Arc<L>> = self.listeners.read().clone();
        let failures: Vec<BoxError> = listeners
            .iter()
            .filter_map(|listener| notify(listener).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ListenerNotificationError {
                listener: self.name,
                failures: ListenerFailures(failures),
            })
        }
    }
}
