//! Error types for work execution and build planning.

use convenient_filelock::FileLockError;
use convenient_graph::GraphError;
use convenient_vfs::VfsError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a unit of work, a listener or any other pluggable
/// collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for work execution.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors raised while executing a single unit of work.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Snapshotting inputs or outputs failed.
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// A cross-process cache could not be locked.
    #[error(transparent)]
    FileLock(#[from] FileLockError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Engine configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The work itself failed.
    #[error("Execution failed for {work}.")]
    WorkFailed {
        /// Display name of the work.
        work: String,
        /// What the work reported.
        #[source]
        source: BoxError,
    },

    /// An input file collection could not be resolved.
    #[error("Cannot resolve input '{property}' of {work}")]
    UnresolvableInput {
        /// Display name of the work.
        work: String,
        /// Input property name.
        property: String,
        /// Resolution failure.
        #[source]
        source: BoxError,
    },

    /// Validation reported errors; the work was not executed.
    #[error("Validation failed for {work}:\n{problems}")]
    Validation {
        /// Display name of the work.
        work: String,
        /// Rendered problems, one per line.
        problems: String,
    },

    /// The work ran longer than its timeout.
    #[error("{work} exceeded its timeout of {timeout:?}")]
    Timeout {
        /// Display name of the work.
        work: String,
        /// Configured limit.
        timeout: Duration,
    },

    /// A value of this type cannot be fingerprinted.
    #[error("Unable to snapshot value of type {0}: no serializer registered")]
    NoSerializer(String),

    /// A build cache entry could not be restored.
    #[error("Build cache entry {key} is corrupt: {reason}")]
    CorruptCacheEntry {
        /// Cache key in hex.
        key: String,
        /// What is wrong with the entry.
        reason: String,
    },
}

/// Errors raised while building, validating or running an execution plan.
#[derive(Debug, Error)]
pub enum PlanError {
    /// An operation was called out of the controller's lifecycle order.
    #[error("Build is in unexpected state: {0}")]
    IllegalState(String),

    /// `finalize_work_graph` was called with tasks still queued.
    #[error("Queued tasks have not been scheduled.")]
    QueuedTasksNotScheduled,

    /// The task graph contains a cycle.
    #[error("Circular dependency between the following tasks:\n{0}")]
    CircularDependency(String),

    /// A task path that is not registered.
    #[error("Task '{0}' not found")]
    UnknownTask(String),

    /// A task or action node registered twice.
    #[error("Cannot add '{0}' as a node with that name already exists")]
    DuplicateNode(String),

    /// The build was cancelled.
    #[error("Build cancelled")]
    Cancelled,

    /// Graph structure error.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Work execution error outside of any node.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// A listener failed.
    #[error(transparent)]
    ListenerNotification(#[from] crate::listener::ListenerNotificationError),

    /// One or more nodes failed.
    #[error(transparent)]
    Failed(#[from] BuildFailure),
}

/// Aggregated failure of a build.
///
/// A single failure renders as itself, several as a numbered list.
#[derive(Debug)]
pub struct BuildFailure {
    causes: Vec<BoxError>,
}

impl BuildFailure {
    /// Wrap the failures collected while running a graph.
    #[must_use]
    pub fn new(causes: Vec<BoxError>) -> Self {
        Self { causes }
    }

    /// The individual failures in the order they occurred.
    #[must_use]
    pub fn causes(&self) -> &[BoxError] {
        &self.causes
    }

    /// Consume into the individual failures.
    #[must_use]
    pub fn into_causes(self) -> Vec<BoxError> {
        self.causes
    }
}

impl From<PlanError> for BuildFailure {
    fn from(error: PlanError) -> Self {
        match error {
            PlanError::Failed(failure) => failure,
            other => Self::new(vec![Box::new(other)]),
        }
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.causes.as_slice() {
            [] => f.write_str("Build failed"),
            [single] => write!(f, "{single}"),
            causes => {
                writeln!(f, "Build completed with {} failures.", causes.len())?;
                for (i, cause) in causes.iter().enumerate() {
                    writeln!(f, "{}: {cause}", i + 1)?;
                    let mut source = cause.source();
                    while let Some(inner) = source {
                        writeln!(f, "   > {inner}")?;
                        source = inner.source();
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.causes.as_slice() {
            [single] => Some(single.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_failure_renders_as_itself() {
        let failure = BuildFailure::new(vec!["compile broke".into()]);
        assert_eq!(failure.to_string(), "compile broke");
        assert!(std::error::Error::source(&failure).is_some());
    }

    #[test]
    fn test_multiple_failures_are_numbered() {
        let failure = BuildFailure::new(vec![
            Box::new(ExecutionError::WorkFailed {
                work: "task ':a'".to_string(),
                source: "boom".into(),
            }),
            "second".into(),
        ]);
        let rendered = failure.to_string();
        assert!(rendered.starts_with("Build completed with 2 failures."));
        assert!(rendered.contains("1: Execution failed for task ':a'."));
        assert!(rendered.contains("   > boom"));
        assert!(rendered.contains("2: second"));
    }

    #[test]
    fn test_plan_error_unwraps_into_failure() {
        let failure = BuildFailure::from(PlanError::Failed(BuildFailure::new(vec!["x".into()])));
        assert_eq!(failure.causes().len(), 1);
        let failure = BuildFailure::from(PlanError::Cancelled);
        assert_eq!(failure.to_string(), "Build cancelled");
    }
}
