//! Detection of tasks that consume another task's outputs without declaring
//! any order between the two.
//!
//! Every task records the locations it writes and reads when it starts. A
//! task reading a location another enabled task writes (the same location,
//! one of its ancestors or something below it) is reported unless one of the
//! two reaches the other through hard successors. Any such order suppresses
//! the report, even if it points from consumer to producer: linters and
//! formatters read and write the same sources and can only declare one
//! direction.

use crate::error::{ExecutionError, Result};
use crate::plan::execution_plan::ExecutionPlan;
use crate::plan::node::{Node, NodeIndex};
use crate::plan::task::InputLocation;
use crate::validation::{ValidationProblem, ValidationProblemId, WorkValidationContext};
use convenient_vfs::SnapshottingFilter;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

struct Access {
    node: NodeIndex,
    root: PathBuf,
    filter: Option<SnapshottingFilter>,
}

impl Access {
    /// Whether this access touches `location`.
    fn touches(&self, location: &Path) -> bool {
        if self.root.starts_with(location) {
            return true;
        }
        match location.strip_prefix(&self.root) {
            Ok(relative) => self
                .filter
                .as_ref()
                .is_none_or(|filter| filter_accepts(filter, relative, location)),
            Err(_) => false,
        }
    }
}

/// A produced location below a filtered tree is read unless excluded. Only
/// an existing regular file is held to the include patterns, since a
/// directory may hold included files.
fn filter_accepts(filter: &SnapshottingFilter, relative: &Path, location: &Path) -> bool {
    if location.is_file() {
        filter.accepts_file(relative)
    } else {
        !filter.is_excluded(relative)
    }
}

#[derive(Default)]
struct Accesses {
    outputs: Vec<Access>,
    inputs: Vec<Access>,
}

/// Shared by all nodes of one plan execution.
#[derive(Default)]
pub struct MissingTaskDependencyDetector {
    accesses: Mutex<Accesses>,
}

impl std::fmt::Debug for MissingTaskDependencyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let accesses = self.accesses.lock();
        f.debug_struct("MissingTaskDependencyDetector")
            .field("outputs", &accesses.outputs.len())
            .field("inputs", &accesses.inputs.len())
            .finish()
    }
}

impl MissingTaskDependencyDetector {
    /// Detector with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what `node` writes and reads and report every enabled task
    /// sharing a location with it without a specified order.
    ///
    /// Deferred inputs are resolved here. When that fails the error is
    /// returned if the task declares outputs, since its history would need
    /// the inputs anyway; otherwise an unresolvable-input warning is
    /// reported and the remaining inputs are still checked.
    ///
    /// # Errors
    ///
    /// `ExecutionError::UnresolvableInput` as described above.
    pub fn detect(
        &self,
        plan: &ExecutionPlan,
        node: &Node,
        context: &mut WorkValidationContext,
    ) -> Result<()> {
        let Some(task) = node.task() else {
            return Ok(());
        };
        let history_maintained = !task.outputs().is_empty();

        let mut inputs: Vec<(PathBuf, Option<SnapshottingFilter>)> = Vec::new();
        for (i, input) in task.inputs().iter().enumerate() {
            match input {
                InputLocation::Path(path) => inputs.push((path.clone(), None)),
                InputLocation::Tree { root, filter } => {
                    let filter = (!filter.is_empty()).then(|| filter.clone());
                    inputs.push((root.clone(), filter));
                }
                InputLocation::Deferred(resolve) => match resolve() {
                    Ok(paths) => inputs.extend(paths.into_iter().map(|path| (path, None))),
                    Err(source) if history_maintained => {
                        return Err(ExecutionError::UnresolvableInput {
                            work: node.to_string(),
                            property: format!("inputs[{i}]"),
                            source,
                        });
                    }
                    Err(source) => context.visit_problem(
                        ValidationProblem::warning(
                            ValidationProblemId::UnresolvableInput,
                            node.to_string(),
                            format!("cannot be resolved:\n\t{source}"),
                        )
                        .for_property(format!("inputs[{i}]"))
                        .happens_because(
                            "An input file collection couldn't be resolved, making it impossible to determine task inputs",
                        )
                        .with_solution("Consider using Task.dependsOn instead"),
                    ),
                },
            }
        }

        let mut accesses = self.accesses.lock();

        for output in task.outputs() {
            accesses.outputs.push(Access {
                node: node.index(),
                root: output.clone(),
                filter: None,
            });
            for consumer in consumers_of(&accesses.inputs, output) {
                report_if_unordered(plan, plan.node(consumer), node, output, context);
            }
        }

        for (root, filter) in inputs {
            let access = Access {
                node: node.index(),
                root,
                filter,
            };
            let producers: Vec<NodeIndex> = dedup(
                accesses
                    .outputs
                    .iter()
                    .filter(|output| access.touches(&output.root))
                    .map(|output| output.node),
            );
            for producer in producers {
                report_if_unordered(plan, node, plan.node(producer), &access.root, context);
            }
            accesses.inputs.push(access);
        }
        Ok(())
    }
}

fn consumers_of(inputs: &[Access], location: &Path) -> Vec<NodeIndex> {
    dedup(
        inputs
            .iter()
            .filter(|input| input.touches(location))
            .map(|input| input.node),
    )
}

fn dedup(nodes: impl Iterator<Item = NodeIndex>) -> Vec<NodeIndex> {
    let mut seen = HashSet::new();
    nodes.filter(|node| seen.insert(*node)).collect()
}

fn report_if_unordered(
    plan: &ExecutionPlan,
    consumer: &Node,
    producer: &Node,
    location: &Path,
    context: &mut WorkValidationContext,
) {
    // The node under check is always enabled; the other one may not be.
    if !consumer.is_enabled() || !producer.is_enabled() {
        return;
    }
    if !has_no_specified_order(plan, producer, consumer) {
        return;
    }
    let problem = ValidationProblem::warning(
        ValidationProblemId::ImplicitDependency,
        consumer.to_string(),
        format!(
            "detected a problem with the following location: '{}'",
            location.display()
        ),
    )
    .happens_because(format!(
        "Task '{}' uses this output of task '{}' without declaring an explicit or implicit dependency. \
         This can lead to incorrect results being produced, depending on what order the tasks are executed.",
        consumer.name(),
        producer.name()
    ))
    .with_solution(format!(
        "Declare task '{}' as an input of '{}'",
        producer.name(),
        consumer.name()
    ))
    .with_solution(format!(
        "Declare an explicit dependency on '{}' from '{}' using Task#dependsOn",
        producer.name(),
        consumer.name()
    ))
    .with_solution(format!(
        "Declare an explicit dependency on '{}' from '{}' using Task#mustRunAfter",
        producer.name(),
        consumer.name()
    ));
    context.visit_problem(problem);
}

/// Neither node reaches the other through hard successors.
pub fn has_no_specified_order(plan: &ExecutionPlan, producer: &Node, consumer: &Node) -> bool {
    misses_dependency(plan, producer, consumer) && misses_dependency(plan, consumer, producer)
}

/// Breadth-first search from `consumer` over hard successors, looking only
/// at task nodes and passing through everything else.
fn misses_dependency(plan: &ExecutionPlan, producer: &Node, consumer: &Node) -> bool {
    if producer.index() == consumer.index() {
        return false;
    }
    if consumer.dependency_successors().contains(&producer.index()) {
        return false;
    }
    let mut seen: HashSet<NodeIndex> = HashSet::new();
    let mut queue: VecDeque<NodeIndex> = VecDeque::new();
    enqueue_task_successors(plan, consumer, &mut seen, &mut queue);
    while let Some(next) = queue.pop_front() {
        if next == producer.index() {
            return false;
        }
        enqueue_task_successors(plan, plan.node(next), &mut seen, &mut queue);
    }
    true
}

fn enqueue_task_successors(
    plan: &ExecutionPlan,
    node: &Node,
    seen: &mut HashSet<NodeIndex>,
    queue: &mut VecDeque<NodeIndex>,
) {
    let mut pending: Vec<NodeIndex> = node.hard_successors().collect();
    let mut passed: HashSet<NodeIndex> = HashSet::new();
    while let Some(successor) = pending.pop() {
        let successor_node = plan.node(successor);
        if successor_node.is_task() {
            if seen.insert(successor) {
                queue.push_back(successor);
            }
        } else if passed.insert(successor) {
            pending.extend(successor_node.hard_successors());
        }
    }
}
