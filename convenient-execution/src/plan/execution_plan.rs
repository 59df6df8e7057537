//! The set of nodes a build runs and the order they may run in.

use crate::error::PlanError;
use crate::plan::node::{Node, NodeIndex, NodeKind};
use crate::plan::task::TaskContainer;
use convenient_graph::{DAG, GraphError, GraphRenderer, WalkOutcome, find_cycles, walk_acyclic};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Nodes requested for a build, with everything they pull in.
///
/// Entry tasks are added while the plan is open. [`ExecutionPlan::finalize_plan`]
/// then resolves ordering relations, rejects cycles and fixes the order in
/// which nodes become eligible.
pub struct ExecutionPlan {
    container: Arc<TaskContainer>,
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeIndex>,
    entry_nodes: Vec<NodeIndex>,
    order: Vec<NodeIndex>,
    finalized: bool,
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("nodes", &self.nodes.len())
            .field("entry_nodes", &self.entry_nodes)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

/// One line of [`ExecutionPlan::report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    /// Task path or action name.
    pub name: String,
    /// Dependencies.
    pub dependencies: Vec<String>,
    /// Must-run-after successors.
    pub must_run_after: Vec<String>,
    /// Kept should-run-after successors.
    pub should_run_after: Vec<String>,
    /// Finalizers.
    pub finalizers: Vec<String>,
}

impl fmt::Display for PlannedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (label, names) in [
            ("dependencies", &self.dependencies),
            ("must run after", &self.must_run_after),
            ("should run after", &self.should_run_after),
            ("finalized by", &self.finalizers),
        ] {
            if !names.is_empty() {
                write!(f, "; {label}: {}", names.join(", "))?;
            }
        }
        Ok(())
    }
}

impl ExecutionPlan {
    /// Empty plan over the tasks of `container`.
    #[must_use]
    pub fn new(container: Arc<TaskContainer>) -> Self {
        Self {
            container,
            nodes: Vec::new(),
            by_name: HashMap::new(),
            entry_nodes: Vec::new(),
            order: Vec::new(),
            finalized: false,
        }
    }

    /// Add `names` and, transitively, their dependencies and finalizers.
    ///
    /// Returns whether any node was added.
    ///
    /// # Errors
    ///
    /// - `PlanError::IllegalState` once the plan is finalized
    /// - `PlanError::UnknownTask` for a name that is not registered, either
    ///   requested or pulled in. The plan is left unchanged.
    pub fn add_entry_tasks<I>(&mut self, names: I) -> Result<bool, PlanError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        if self.finalized {
            return Err(PlanError::IllegalState(
                "cannot add tasks to a finalized execution plan".to_string(),
            ));
        }
        let names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        if let Some(unknown) = names.iter().find(|name| !self.container.contains(name)) {
            return Err(PlanError::UnknownTask(unknown.clone()));
        }

        let before = self.nodes.len();
        let entries_before = self.entry_nodes.len();
        let required_before: Vec<bool> = self.nodes.iter().map(|node| node.required).collect();
        if let Err(err) = self.add_closure(names) {
            // Leave the plan as it was so no node is kept without its dependencies
            self.nodes.truncate(before);
            self.by_name.retain(|_, index| index.0 < before);
            self.entry_nodes.truncate(entries_before);
            for (node, required) in self.nodes.iter_mut().zip(required_before) {
                node.required = required;
            }
            return Err(err);
        }
        let added = self.nodes.len() > before;
        if added {
            debug!(nodes = self.nodes.len(), "Added entry tasks to execution plan");
        }
        Ok(added)
    }

    fn add_closure(&mut self, names: Vec<String>) -> Result<(), PlanError> {
        let mut queue: VecDeque<(String, bool)> = VecDeque::new();
        for name in names {
            let index = self.add_node(&name, true, &mut queue)?;
            if !self.entry_nodes.contains(&index) {
                self.entry_nodes.push(index);
            }
            self.drain(&mut queue)?;
        }
        Ok(())
    }

    fn drain(&mut self, queue: &mut VecDeque<(String, bool)>) -> Result<(), PlanError> {
        while let Some((name, required)) = queue.pop_front() {
            let _ = self.add_node(&name, required, queue)?;
        }
        Ok(())
    }

    /// The node is inserted before its dependencies so that insertion order
    /// follows the order tasks were requested in.
    fn add_node(
        &mut self,
        name: &str,
        required: bool,
        queue: &mut VecDeque<(String, bool)>,
    ) -> Result<NodeIndex, PlanError> {
        if let Some(&index) = self.by_name.get(name) {
            let node = &mut self.nodes[index.0];
            if required && !node.required {
                node.required = true;
            }
            return Ok(index);
        }

        let kind = if let Some(task) = self.container.task(name) {
            for dependency in task.dependencies() {
                queue.push_back((dependency.clone(), true));
            }
            for finalizer in task.finalizers() {
                queue.push_back((finalizer.clone(), false));
            }
            NodeKind::Task(Arc::clone(task))
        } else if let Some(action) = self.container.action(name) {
            for dependency in action.dependencies() {
                queue.push_back((dependency.clone(), true));
            }
            NodeKind::Action(Arc::clone(action))
        } else {
            return Err(PlanError::UnknownTask(name.to_string()));
        };

        let index = NodeIndex(self.nodes.len());
        self.nodes.push(Node::new(index, name.to_string(), kind, required));
        let _ = self.by_name.insert(name.to_string(), index);
        Ok(index)
    }

    /// Resolve relations, reject cycles and fix the execution order.
    ///
    /// # Errors
    ///
    /// - `PlanError::IllegalState` if the plan is already finalized
    /// - `PlanError::CircularDependency` with the rendered cycle if hard
    ///   successors form a cycle
    pub fn finalize_plan(&mut self) -> Result<(), PlanError> {
        if self.finalized {
            return Err(PlanError::IllegalState(
                "execution plan is already finalized".to_string(),
            ));
        }
        self.resolve_relations()?;
        self.check_for_cycles()?;

        let mut dag: DAG<NodeIndex, ()> = DAG::new();
        let ids: Vec<_> = self.nodes.iter().map(|node| dag.add_node(node.index)).collect();
        for node in &self.nodes {
            for successor in node.hard_successors() {
                dag.add_edge(ids[successor.0], ids[node.index.0], ())?;
            }
        }

        // Should-run-after is a preference only; drop edges that would close a
        // cycle.
        for i in 0..self.nodes.len() {
            let wanted: Vec<NodeIndex> = self.nodes[i].should_successors.iter().copied().collect();
            for successor in wanted {
                match dag.add_edge(ids[successor.0], ids[i], ()) {
                    Ok(()) => {}
                    Err(GraphError::CycleDetected(_)) => {
                        debug!(
                            node = %self.nodes[i].name,
                            successor = %self.nodes[successor.0].name,
                            "Ignoring should-run-after ordering that would create a cycle"
                        );
                        let _ = self.nodes[i].should_successors.remove(&successor);
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        }

        for i in 0..self.nodes.len() {
            let successors: Vec<NodeIndex> = self.nodes[i].all_successors().collect();
            for successor in successors {
                let _ = self.nodes[successor.0].dependents.insert(NodeIndex(i));
            }
        }

        self.order = dag
            .topological_sort()?
            .into_iter()
            .map(|id| dag.node(id).copied())
            .collect::<Result<_, _>>()?;
        self.finalized = true;
        info!(
            nodes = self.nodes.len(),
            entry_tasks = self.entry_nodes.len(),
            "Execution plan finalized"
        );
        Ok(())
    }

    /// Ordering relations only link nodes already in the plan. Dependencies
    /// and finalizers were pulled in when the node was added, so a missing one
    /// is an error.
    fn resolve_relations(&mut self) -> Result<(), PlanError> {
        for i in 0..self.nodes.len() {
            let (dependencies, must, should, finalizers) = match &self.nodes[i].kind {
                NodeKind::Task(task) => (
                    task.dependencies().to_vec(),
                    task.must_run_after_tasks().to_vec(),
                    task.should_run_after_tasks().to_vec(),
                    task.finalizers().to_vec(),
                ),
                NodeKind::Action(action) => {
                    (action.dependencies().to_vec(), Vec::new(), Vec::new(), Vec::new())
                }
            };
            let lookup = |names: Vec<String>| -> BTreeSet<NodeIndex> {
                names
                    .iter()
                    .filter_map(|name| self.by_name.get(name).copied())
                    .collect()
            };
            let require = |names: Vec<String>| -> Result<BTreeSet<NodeIndex>, PlanError> {
                names
                    .into_iter()
                    .map(|name| match self.by_name.get(&name) {
                        Some(&index) => Ok(index),
                        None => Err(PlanError::UnknownTask(name)),
                    })
                    .collect()
            };
            let dependencies = require(dependencies)?;
            let must = lookup(must);
            let should = lookup(should);
            let finalizers = require(finalizers)?;

            for &finalizer in &finalizers {
                let _ = self.nodes[finalizer.0].finalizing_successors.insert(NodeIndex(i));
            }
            let node = &mut self.nodes[i];
            node.dependency_successors = dependencies;
            node.must_successors = must;
            node.should_successors = should;
            node.finalizers = finalizers;
        }
        Ok(())
    }

    fn check_for_cycles(&self) -> Result<(), PlanError> {
        let roots: Vec<NodeIndex> = self.nodes.iter().map(|node| node.index).collect();
        let successors = |index: NodeIndex| self.nodes[index.0].hard_successors().collect::<Vec<_>>();

        let WalkOutcome::Cycle(start) = walk_acyclic(roots.iter().copied(), successors) else {
            return Ok(());
        };
        let members: BTreeSet<NodeIndex> = find_cycles(roots.iter().copied(), successors)
            .into_iter()
            .find(|cycle| cycle.contains(&start))
            .map(|cycle| cycle.into_iter().collect())
            .unwrap_or_else(|| BTreeSet::from([start]));

        let rendered = GraphRenderer::new(
            |index: NodeIndex| self.nodes[index.0].to_string(),
            |index: NodeIndex| {
                self.nodes[index.0]
                    .hard_successors()
                    .filter(|successor| members.contains(successor))
                    .collect()
            },
        )
        .render(start);
        Err(PlanError::CircularDependency(rendered))
    }

    /// Whether the plan has been finalized.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether `name` is part of the plan.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Node with the given index.
    ///
    /// # Panics
    ///
    /// If the index is not from this plan.
    #[must_use]
    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.0]
    }

    /// Node named `name`.
    #[must_use]
    pub fn node_named(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).map(|index| &self.nodes[index.0])
    }

    /// All nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Requested nodes in request order.
    #[must_use]
    pub fn entry_nodes(&self) -> &[NodeIndex] {
        &self.entry_nodes
    }

    /// Nodes in the order they become eligible; empty until finalized.
    #[must_use]
    pub fn execution_order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Names in execution order; empty until finalized.
    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.order.iter().map(|index| self.nodes[index.0].name()).collect()
    }

    /// Every node in execution order with its resolved successors.
    #[must_use]
    pub fn report(&self) -> Vec<PlannedNode> {
        let names = |set: &BTreeSet<NodeIndex>| -> Vec<String> {
            set.iter().map(|index| self.nodes[index.0].name.clone()).collect()
        };
        self.order
            .iter()
            .map(|index| {
                let node = &self.nodes[index.0];
                PlannedNode {
                    name: node.name.clone(),
                    dependencies: names(&node.dependency_successors),
                    must_run_after: names(&node.must_successors),
                    should_run_after: names(&node.should_successors),
                    finalizers: names(&node.finalizers),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::task::{ActionNodeDefinition, TaskDefinition};

    fn plan_of(tasks: Vec<TaskDefinition>) -> ExecutionPlan {
        let mut container = TaskContainer::new();
        for task in tasks {
            container.register(task).unwrap();
        }
        ExecutionPlan::new(Arc::new(container))
    }

    #[test]
    fn test_dependencies_are_pulled_in_and_ordered_first() {
        let mut plan = plan_of(vec![
            TaskDefinition::new(":compile"),
            TaskDefinition::new(":jar").depends_on(":compile"),
            TaskDefinition::new(":test").depends_on(":compile"),
        ]);
        assert!(plan.add_entry_tasks([":jar"]).unwrap());
        assert!(plan.add_entry_tasks([":test"]).unwrap());
        assert!(!plan.add_entry_tasks([":jar"]).unwrap());
        plan.finalize_plan().unwrap();
        assert_eq!(plan.task_names(), [":compile", ":jar", ":test"]);
    }

    #[test]
    fn test_unknown_task() {
        let mut plan = plan_of(vec![TaskDefinition::new(":a").depends_on(":missing")]);
        assert!(matches!(
            plan.add_entry_tasks([":nope"]),
            Err(PlanError::UnknownTask(name)) if name == ":nope"
        ));
        assert!(plan.is_empty());
        assert!(matches!(
            plan.add_entry_tasks([":a"]),
            Err(PlanError::UnknownTask(name)) if name == ":missing"
        ));
    }

    #[test]
    fn test_failed_add_leaves_the_plan_unchanged() {
        let mut plan = plan_of(vec![
            TaskDefinition::new(":a").depends_on(":b").depends_on(":missing"),
            TaskDefinition::new(":b"),
            TaskDefinition::new(":c").finalized_by(":b"),
        ]);
        assert!(plan.add_entry_tasks([":c"]).unwrap());
        assert!(!plan.node_named(":b").unwrap().is_required());

        assert!(matches!(
            plan.add_entry_tasks([":a"]),
            Err(PlanError::UnknownTask(name)) if name == ":missing"
        ));
        // Retrying must not find a half-added :a and report nothing new
        assert!(matches!(
            plan.add_entry_tasks([":a"]),
            Err(PlanError::UnknownTask(name)) if name == ":missing"
        ));
        assert!(!plan.contains(":a"));
        assert_eq!(plan.entry_nodes().len(), 1);
        assert!(!plan.node_named(":b").unwrap().is_required());

        plan.finalize_plan().unwrap();
        assert_eq!(plan.task_names(), [":c", ":b"]);
    }

    #[test]
    fn test_ordering_only_links_nodes_in_the_plan() {
        let mut plan = plan_of(vec![
            TaskDefinition::new(":clean"),
            TaskDefinition::new(":build").must_run_after(":clean"),
        ]);
        let _ = plan.add_entry_tasks([":build"]).unwrap();
        plan.finalize_plan().unwrap();
        assert!(!plan.contains(":clean"));
        assert!(plan.node_named(":build").unwrap().must_successors().is_empty());

        let mut plan = plan_of(vec![
            TaskDefinition::new(":clean"),
            TaskDefinition::new(":build").must_run_after(":clean"),
        ]);
        let _ = plan.add_entry_tasks([":build", ":clean"]).unwrap();
        plan.finalize_plan().unwrap();
        assert_eq!(plan.task_names(), [":clean", ":build"]);
    }

    #[test]
    fn test_should_run_after_is_dropped_when_it_would_cycle() {
        let mut plan = plan_of(vec![
            TaskDefinition::new(":a").depends_on(":b"),
            TaskDefinition::new(":b").should_run_after(":a"),
        ]);
        let _ = plan.add_entry_tasks([":a"]).unwrap();
        plan.finalize_plan().unwrap();
        assert_eq!(plan.task_names(), [":b", ":a"]);
        assert!(plan.node_named(":b").unwrap().should_successors().is_empty());
    }

    #[test]
    fn test_cycle_is_rendered_from_any_start() {
        for entry in [":a", ":b", ":c"] {
            let mut plan = plan_of(vec![
                TaskDefinition::new(":a").depends_on(":b"),
                TaskDefinition::new(":b").depends_on(":c"),
                TaskDefinition::new(":c").depends_on(":a"),
            ]);
            let _ = plan.add_entry_tasks([entry]).unwrap();
            let err = plan.finalize_plan().unwrap_err();
            let message = err.to_string();
            assert!(message.starts_with("Circular dependency between the following tasks:"));
            for name in ["task ':a'", "task ':b'", "task ':c'"] {
                assert!(message.contains(name), "{name} missing from {message}");
            }
            assert!(message.contains("(*)"));
        }
    }

    #[test]
    fn test_finalizers_wait_for_the_finalized_node() {
        let mut plan = plan_of(vec![
            TaskDefinition::new(":test").finalized_by(":report"),
            TaskDefinition::new(":report"),
        ]);
        let _ = plan.add_entry_tasks([":test"]).unwrap();
        plan.finalize_plan().unwrap();
        assert_eq!(plan.task_names(), [":test", ":report"]);
        let report = plan.node_named(":report").unwrap();
        assert!(!report.is_required());
        assert_eq!(report.finalizing_successors().len(), 1);
        assert_eq!(
            plan.report()[0].to_string(),
            ":test; finalized by: :report"
        );
    }

    #[test]
    fn test_action_nodes_join_the_plan() {
        let mut container = TaskContainer::new();
        container
            .register_action(ActionNodeDefinition::new("transform", || Ok(())))
            .unwrap();
        container
            .register(TaskDefinition::new(":compile").depends_on("transform"))
            .unwrap();
        let mut plan = ExecutionPlan::new(Arc::new(container));
        let _ = plan.add_entry_tasks([":compile"]).unwrap();
        plan.finalize_plan().unwrap();
        assert_eq!(plan.task_names(), ["transform", ":compile"]);
        assert!(!plan.node_named("transform").unwrap().is_task());
    }

    #[test]
    fn test_finalized_plan_is_closed() {
        let mut plan = plan_of(vec![TaskDefinition::new(":a")]);
        let _ = plan.add_entry_tasks([":a"]).unwrap();
        plan.finalize_plan().unwrap();
        assert!(matches!(plan.add_entry_tasks([":a"]), Err(PlanError::IllegalState(_))));
        assert!(matches!(plan.finalize_plan(), Err(PlanError::IllegalState(_))));
    }
}
