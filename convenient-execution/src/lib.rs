//! Incremental build execution.
//!
//! A build registers tasks in a [`TaskContainer`], hands them to a
//! [`BuildController`] and lets it:
//! - pull requested tasks and everything they depend on into an
//!   [`ExecutionPlan`], rejecting cycles with the full cycle rendered
//! - run the plan on a bounded worker pool, longest remaining chain first
//! - skip work whose inputs and outputs are unchanged, or restore its
//!   outputs from the local build cache
//! - warn when a task reads a location another task writes without any
//!   declared order between the two
//!
//! Shared state lives in [`BuildServices`]: the virtual file system, the
//! cross-process lock manager, execution history and the build cache.
//!
//! # Example
//!
//! ```no_run
//! use convenient_execution::{
//!     BuildCancellationToken, BuildController, BuildServices, EngineConfig, TaskContainer,
//!     TaskDefinition, ThreadBuildExecutor,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut tasks = TaskContainer::new();
//! tasks.register(TaskDefinition::new(":compile"))?;
//! tasks.register(TaskDefinition::new(":jar").depends_on(":compile"))?;
//!
//! let services = BuildServices::open(EngineConfig::from_env()?, Path::new("."))?;
//! let controller = BuildController::new(
//!     Arc::new(services),
//!     Arc::new(tasks),
//!     BuildCancellationToken::new(),
//! );
//! controller.populate_work_graph([":jar"])?;
//! controller.finalize_work_graph()?;
//! controller.start_execution(&ThreadBuildExecutor, |outcome| {
//!     println!("{}", if outcome.is_ok() { "BUILD SUCCESSFUL" } else { "BUILD FAILED" });
//! })?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod cancellation;
pub mod config;
pub mod controller;
pub mod error;
pub mod lease;
pub mod listener;
pub mod logging;
pub mod plan;
pub mod services;
pub mod validation;
pub mod work;

pub use cancellation::BuildCancellationToken;
pub use config::EngineConfig;
pub use controller::{BuildCompletion, BuildController, BuildExecutor, BuildState, ThreadBuildExecutor};
pub use error::{BoxError, BuildFailure, ExecutionError, PlanError};
pub use listener::{TaskExecutionGraphListener, TaskExecutionListener};
pub use plan::{
    ActionNodeDefinition, ExecutionPlan, NodeState, PlanExecutionResult, PlanExecutor,
    TaskContainer, TaskDefinition,
};
pub use services::BuildServices;
pub use validation::{Severity, ValidationProblem, ValidationProblemId};
pub use work::engine::{ExecutionEngine, ExecutionOutcome};
pub use work::{FileInput, FnWork, UnitOfWork, WorkResult};
