//! Task definitions and the container they are registered in.

use crate::error::{BoxError, PlanError};
use crate::work::UnitOfWork;
use convenient_vfs::SnapshottingFilter;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A location a task reads.
#[derive(Clone)]
pub enum InputLocation {
    /// A file or a whole directory.
    Path(PathBuf),
    /// A directory restricted by a filter.
    Tree {
        /// Directory.
        root: PathBuf,
        /// Which entries below `root` are read.
        filter: SnapshottingFilter,
    },
    /// Locations known only when the task is about to run.
    Deferred(Arc<dyn Fn() -> Result<Vec<PathBuf>, BoxError> + Send + Sync>),
}

impl fmt::Debug for InputLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Tree { root, .. } => f.debug_struct("Tree").field("root", root).finish_non_exhaustive(),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// A task: a named node with ordering relations, declared locations and,
/// usually, a unit of work to run.
#[derive(Clone)]
pub struct TaskDefinition {
    path: String,
    depends_on: Vec<String>,
    must_run_after: Vec<String>,
    should_run_after: Vec<String>,
    finalized_by: Vec<String>,
    inputs: Vec<InputLocation>,
    outputs: Vec<PathBuf>,
    enabled: bool,
    work: Option<Arc<dyn UnitOfWork>>,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("path", &self.path)
            .field("depends_on", &self.depends_on)
            .field("must_run_after", &self.must_run_after)
            .field("should_run_after", &self.should_run_after)
            .field("finalized_by", &self.finalized_by)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl TaskDefinition {
    /// Enabled task at `path` with nothing declared.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            depends_on: Vec::new(),
            must_run_after: Vec::new(),
            should_run_after: Vec::new(),
            finalized_by: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            enabled: true,
            work: None,
        }
    }

    /// Run after `task` completes successfully, pulling it into the graph.
    #[must_use]
    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.depends_on.push(task.into());
        self
    }

    /// Run after `task` if both are in the graph.
    #[must_use]
    pub fn must_run_after(mut self, task: impl Into<String>) -> Self {
        self.must_run_after.push(task.into());
        self
    }

    /// Prefer running after `task`; dropped if it would create a cycle.
    #[must_use]
    pub fn should_run_after(mut self, task: impl Into<String>) -> Self {
        self.should_run_after.push(task.into());
        self
    }

    /// Run `task` once this task has executed, even if it failed.
    #[must_use]
    pub fn finalized_by(mut self, task: impl Into<String>) -> Self {
        self.finalized_by.push(task.into());
        self
    }

    /// Declare a file or directory input.
    #[must_use]
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(InputLocation::Path(path.into()));
        self
    }

    /// Declare a filtered directory input.
    #[must_use]
    pub fn input_tree(mut self, root: impl Into<PathBuf>, filter: SnapshottingFilter) -> Self {
        self.inputs.push(InputLocation::Tree {
            root: root.into(),
            filter,
        });
        self
    }

    /// Declare inputs resolved right before the task runs.
    #[must_use]
    pub fn input_deferred(
        mut self,
        resolver: impl Fn() -> Result<Vec<PathBuf>, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.inputs.push(InputLocation::Deferred(Arc::new(resolver)));
        self
    }

    /// Declare an output location.
    #[must_use]
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Enable or disable the task. A disabled task is skipped and counts
    /// as successful.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Unit of work run when the task executes.
    #[must_use]
    pub fn work(mut self, work: Arc<dyn UnitOfWork>) -> Self {
        self.work = Some(work);
        self
    }

    /// Task path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Tasks this task depends on.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// Must-run-after targets.
    #[must_use]
    pub fn must_run_after_tasks(&self) -> &[String] {
        &self.must_run_after
    }

    /// Should-run-after targets.
    #[must_use]
    pub fn should_run_after_tasks(&self) -> &[String] {
        &self.should_run_after
    }

    /// Finalizers.
    #[must_use]
    pub fn finalizers(&self) -> &[String] {
        &self.finalized_by
    }

    /// Declared inputs.
    #[must_use]
    pub fn inputs(&self) -> &[InputLocation] {
        &self.inputs
    }

    /// Declared outputs.
    #[must_use]
    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    /// Whether the task is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Unit of work, if any.
    #[must_use]
    pub fn unit_of_work(&self) -> Option<&Arc<dyn UnitOfWork>> {
        self.work.as_ref()
    }
}

/// Action run by an [`ActionNodeDefinition`].
pub type NodeAction = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>;

/// A node that is not a task, such as a transform step between tasks.
#[derive(Clone)]
pub struct ActionNodeDefinition {
    name: String,
    depends_on: Vec<String>,
    action: NodeAction,
}

impl fmt::Debug for ActionNodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionNodeDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

impl ActionNodeDefinition {
    /// Node `name` running `action`.
    pub fn new(name: impl Into<String>, action: impl Fn() -> Result<(), BoxError> + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            action: Arc::new(action),
        }
    }

    /// Run after `node`.
    #[must_use]
    pub fn depends_on(mut self, node: impl Into<String>) -> Self {
        self.depends_on.push(node.into());
        self
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes this one depends on.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// Run the action.
    ///
    /// # Errors
    ///
    /// Whatever the action reports.
    pub fn run(&self) -> Result<(), BoxError> {
        (self.action)()
    }
}

/// Every task and action node known to a build, by name.
#[derive(Debug, Default)]
pub struct TaskContainer {
    tasks: BTreeMap<String, Arc<TaskDefinition>>,
    actions: BTreeMap<String, Arc<ActionNodeDefinition>>,
}

impl TaskContainer {
    /// Empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task`.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::DuplicateNode` if the name is taken.
    pub fn register(&mut self, task: TaskDefinition) -> Result<(), PlanError> {
        if self.contains(task.path()) {
            return Err(PlanError::DuplicateNode(task.path().to_string()));
        }
        let _ = self.tasks.insert(task.path().to_string(), Arc::new(task));
        Ok(())
    }

    /// Register an action node.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::DuplicateNode` if the name is taken.
    pub fn register_action(&mut self, action: ActionNodeDefinition) -> Result<(), PlanError> {
        if self.contains(action.name()) {
            return Err(PlanError::DuplicateNode(action.name().to_string()));
        }
        let _ = self.actions.insert(action.name().to_string(), Arc::new(action));
        Ok(())
    }

    /// Whether a task or action node is registered as `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name) || self.actions.contains_key(name)
    }

    /// Task registered as `path`.
    #[must_use]
    pub fn task(&self, path: &str) -> Option<&Arc<TaskDefinition>> {
        self.tasks.get(path)
    }

    /// Action node registered as `name`.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&Arc<ActionNodeDefinition>> {
        self.actions.get(name)
    }

    /// Task paths in name order.
    pub fn task_paths(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut container = TaskContainer::new();
        container.register(TaskDefinition::new(":compile")).unwrap();
        let err = container.register(TaskDefinition::new(":compile")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot add ':compile' as a node with that name already exists"
        );
        let err = container
            .register_action(ActionNodeDefinition::new(":compile", || Ok(())))
            .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateNode(_)));
    }

    #[test]
    fn test_builder_records_relations() {
        let task = TaskDefinition::new(":jar")
            .depends_on(":compile")
            .must_run_after(":clean")
            .should_run_after(":lint")
            .finalized_by(":report")
            .input("/out/classes")
            .output("/out/app.jar")
            .enabled(false);
        assert_eq!(task.dependencies(), [":compile"]);
        assert_eq!(task.must_run_after_tasks(), [":clean"]);
        assert_eq!(task.should_run_after_tasks(), [":lint"]);
        assert_eq!(task.finalizers(), [":report"]);
        assert_eq!(task.outputs(), [PathBuf::from("/out/app.jar")]);
        assert!(!task.is_enabled());
        assert!(task.unit_of_work().is_none());
    }
}
