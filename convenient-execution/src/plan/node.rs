//! Nodes of an execution plan.

use crate::plan::task::{ActionNodeDefinition, TaskDefinition};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Position of a node in its plan. Nodes are numbered in the order they were
/// added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub(crate) usize);

impl NodeIndex {
    /// Raw index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a node runs.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A registered task.
    Task(Arc<TaskDefinition>),
    /// A non-task action.
    Action(Arc<ActionNodeDefinition>),
}

/// A scheduled task or action together with its resolved relations.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) index: NodeIndex,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) dependency_successors: BTreeSet<NodeIndex>,
    pub(crate) must_successors: BTreeSet<NodeIndex>,
    pub(crate) should_successors: BTreeSet<NodeIndex>,
    /// Nodes this node finalizes; it waits for them but not for their
    /// success.
    pub(crate) finalizing_successors: BTreeSet<NodeIndex>,
    pub(crate) finalizers: BTreeSet<NodeIndex>,
    /// Nodes waiting on this one through any kept edge.
    pub(crate) dependents: BTreeSet<NodeIndex>,
    /// Requested directly or as a dependency. A node pulled in only as a
    /// finalizer runs only when something it finalizes executed.
    pub(crate) required: bool,
}

impl Node {
    pub(crate) fn new(index: NodeIndex, name: String, kind: NodeKind, required: bool) -> Self {
        Self {
            index,
            name,
            kind,
            dependency_successors: BTreeSet::new(),
            must_successors: BTreeSet::new(),
            should_successors: BTreeSet::new(),
            finalizing_successors: BTreeSet::new(),
            finalizers: BTreeSet::new(),
            dependents: BTreeSet::new(),
            required,
        }
    }

    /// Index in the plan.
    #[must_use]
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Task path or action name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the node runs.
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The task, if this is a task node.
    #[must_use]
    pub fn task(&self) -> Option<&Arc<TaskDefinition>> {
        match &self.kind {
            NodeKind::Task(task) => Some(task),
            NodeKind::Action(_) => None,
        }
    }

    /// Whether this is a task node.
    #[must_use]
    pub fn is_task(&self) -> bool {
        matches!(self.kind, NodeKind::Task(_))
    }

    /// Whether the node is enabled. Action nodes always are.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.task().is_none_or(|task| task.is_enabled())
    }

    /// Whether the node was requested or is a dependency of a requested node.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Nodes that must succeed before this one.
    #[must_use]
    pub fn dependency_successors(&self) -> &BTreeSet<NodeIndex> {
        &self.dependency_successors
    }

    /// Nodes this one must run after.
    #[must_use]
    pub fn must_successors(&self) -> &BTreeSet<NodeIndex> {
        &self.must_successors
    }

    /// Nodes this one should run after, limited to those kept in the plan.
    #[must_use]
    pub fn should_successors(&self) -> &BTreeSet<NodeIndex> {
        &self.should_successors
    }

    /// Nodes this one finalizes.
    #[must_use]
    pub fn finalizing_successors(&self) -> &BTreeSet<NodeIndex> {
        &self.finalizing_successors
    }

    /// Nodes finalizing this one.
    #[must_use]
    pub fn finalizers(&self) -> &BTreeSet<NodeIndex> {
        &self.finalizers
    }

    /// Nodes waiting for this one.
    #[must_use]
    pub fn dependents(&self) -> &BTreeSet<NodeIndex> {
        &self.dependents
    }

    /// Successors that constrain scheduling.
    pub fn hard_successors(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.dependency_successors
            .iter()
            .chain(&self.must_successors)
            .chain(&self.finalizing_successors)
            .copied()
    }

    /// Every node this one waits for before it may start.
    pub fn all_successors(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.hard_successors().chain(self.should_successors.iter().copied())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NodeKind::Task(_) => write!(f, "task '{}'", self.name),
            NodeKind::Action(_) => write!(f, "node '{}'", self.name),
        }
    }
}
