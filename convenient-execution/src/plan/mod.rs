//! Execution plans: which nodes a build runs, in which order, and how they
//! are executed.

pub mod execution_plan;
pub mod executor;
pub mod missing_dependencies;
pub mod node;
pub mod task;

pub use execution_plan::{ExecutionPlan, PlannedNode};
pub use executor::{
    ActionNodeExecutor, LocalTaskNodeExecutor, NodeExecutionContext, NodeExecutor, NodeState,
    PlanExecutionResult, PlanExecutor,
};
pub use missing_dependencies::{MissingTaskDependencyDetector, has_no_specified_order};
pub use node::{Node, NodeIndex, NodeKind};
pub use task::{ActionNodeDefinition, InputLocation, NodeAction, TaskContainer, TaskDefinition};
