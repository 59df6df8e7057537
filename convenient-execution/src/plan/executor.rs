//! Parallel execution of a finalized plan.
//!
//! One coordinator decides which nodes may start and hands them to a fixed
//! set of worker threads over a channel. Ready nodes are taken from a
//! priority queue: the longest chain of waiting nodes first, then the node
//! most others wait on, then plan order.

use crate::error::{BoxError, BuildFailure, PlanError};
use crate::listener::{ListenerBroadcast, TaskExecutionListener};
use crate::plan::execution_plan::ExecutionPlan;
use crate::plan::missing_dependencies::MissingTaskDependencyDetector;
use crate::plan::node::{Node, NodeIndex, NodeKind};
use crate::validation::{ValidationProblem, WorkValidationContext};
use crate::work::engine::{ExecutionEngine, ExecutionOutcome};
use crossbeam::channel;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Final state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Skipped: a dependency failed, the build stopped, or nothing it
    /// finalizes ran.
    NotExecuted,
    /// Skipped because the task is disabled. Counts as success.
    Disabled,
    /// Ran successfully; task nodes with work report how.
    Executed(Option<ExecutionOutcome>),
    /// Ran and failed.
    Failed,
}

impl NodeState {
    /// Whether dependents may run.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Executed(_) | Self::Disabled)
    }

    /// Whether the node actually ran, successfully or not.
    #[must_use]
    pub fn did_execute(self) -> bool {
        matches!(self, Self::Executed(_) | Self::Failed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotExecuted => f.write_str("NOT-EXECUTED"),
            Self::Disabled => f.write_str("SKIPPED"),
            Self::Executed(Some(outcome)) => write!(f, "{outcome}"),
            Self::Executed(None) => f.write_str("EXECUTED"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

/// What a [`NodeExecutor`] gets to run one node.
pub struct NodeExecutionContext<'a> {
    engine: &'a ExecutionEngine,
    plan: &'a ExecutionPlan,
    detector: &'a MissingTaskDependencyDetector,
    problems: Vec<ValidationProblem>,
}

impl fmt::Debug for NodeExecutionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeExecutionContext")
            .field("problems", &self.problems.len())
            .finish_non_exhaustive()
    }
}

impl<'a> NodeExecutionContext<'a> {
    /// Engine running units of work.
    #[must_use]
    pub fn engine(&self) -> &'a ExecutionEngine {
        self.engine
    }

    /// Plan being executed.
    #[must_use]
    pub fn plan(&self) -> &'a ExecutionPlan {
        self.plan
    }

    /// Detector shared by every node of the plan.
    #[must_use]
    pub fn detector(&self) -> &'a MissingTaskDependencyDetector {
        self.detector
    }

    /// Attach already logged problems to the node's result.
    pub fn record_problems(&mut self, problems: impl IntoIterator<Item = ValidationProblem>) {
        self.problems.extend(problems);
    }
}

/// Runs nodes of one kind.
pub trait NodeExecutor: Send + Sync {
    /// Run `node` if this executor handles it; `None` otherwise.
    fn execute(
        &self,
        node: &Node,
        context: &mut NodeExecutionContext<'_>,
    ) -> Option<Result<Option<ExecutionOutcome>, BoxError>>;
}

/// Runs task nodes: checks for missing dependencies, then brings the task's
/// unit of work up to date.
#[derive(Debug, Default)]
pub struct LocalTaskNodeExecutor;

impl NodeExecutor for LocalTaskNodeExecutor {
    fn execute(
        &self,
        node: &Node,
        context: &mut NodeExecutionContext<'_>,
    ) -> Option<Result<Option<ExecutionOutcome>, BoxError>> {
        let task = node.task()?;
        let mut validation = WorkValidationContext::new();
        let detected = context.detector.detect(context.plan, node, &mut validation);
        context.record_problems(validation.into_problems());
        if let Err(err) = detected {
            return Some(Err(Box::new(err)));
        }

        let Some(work) = task.unit_of_work() else {
            return Some(Ok(None));
        };
        Some(match context.engine.execute(work.as_ref()) {
            Ok(result) => {
                context.record_problems(result.problems);
                Ok(Some(result.outcome))
            }
            Err(err) => Err(Box::new(err)),
        })
    }
}

/// Runs action nodes.
#[derive(Debug, Default)]
pub struct ActionNodeExecutor;

impl NodeExecutor for ActionNodeExecutor {
    fn execute(
        &self,
        node: &Node,
        _context: &mut NodeExecutionContext<'_>,
    ) -> Option<Result<Option<ExecutionOutcome>, BoxError>> {
        match node.kind() {
            NodeKind::Action(action) => Some(action.run().map(|()| None)),
            NodeKind::Task(_) => None,
        }
    }
}

/// Outcome of executing a plan.
#[derive(Debug, Default)]
pub struct PlanExecutionResult {
    /// Final state of every node, in plan order.
    pub states: Vec<(String, NodeState)>,
    /// Nodes in the order they were started.
    pub execution_order: Vec<String>,
    /// Failures in the order they occurred.
    pub failures: Vec<BoxError>,
    /// Problems reported while running nodes.
    pub validation_problems: Vec<ValidationProblem>,
}

impl PlanExecutionResult {
    /// Final state of `name`.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<NodeState> {
        self.states
            .iter()
            .find(|(node, _)| node == name)
            .map(|(_, state)| *state)
    }

    /// Whether every node succeeded or was skipped without a failure.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Ok when nothing failed, otherwise every failure in one
    /// [`BuildFailure`].
    ///
    /// # Errors
    ///
    /// See above.
    pub fn into_result(self) -> Result<(), BuildFailure> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(BuildFailure::new(self.failures))
        }
    }
}

/// Priority of a ready node; larger runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct NodePriority {
    critical_path_length: u32,
    dependent_count: u32,
    position: Reverse<usize>,
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyNode {
    priority: NodePriority,
    index: NodeIndex,
}

impl Ord for ReadyNode {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority)
    }
}

impl PartialOrd for ReadyNode {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

fn priorities(plan: &ExecutionPlan) -> Vec<NodePriority> {
    let mut result = vec![
        NodePriority {
            critical_path_length: 0,
            dependent_count: 0,
            position: Reverse(0),
        };
        plan.len()
    ];
    let order = plan.execution_order();
    // Dependents come later in the order, so walk it backwards.
    for (position, &index) in order.iter().enumerate().rev() {
        let node = plan.node(index);
        let longest_dependent = node
            .dependents()
            .iter()
            .map(|dependent| result[dependent.index()].critical_path_length)
            .max()
            .unwrap_or(0);
        result[index.index()] = NodePriority {
            critical_path_length: longest_dependent + 1,
            dependent_count: u32::try_from(node.dependents().len()).unwrap_or(u32::MAX),
            position: Reverse(position),
        };
    }
    result
}

enum Decision {
    Run,
    Skip(NodeState),
}

struct Finished {
    index: NodeIndex,
    state: NodeState,
    failures: Vec<BoxError>,
    problems: Vec<ValidationProblem>,
}

fn panicked(node: &Node, payload: &(dyn Any + Send)) -> Finished {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(node = %node.name(), %message, "{node} panicked");
    Finished {
        index: node.index(),
        state: NodeState::Failed,
        failures: vec![format!("{node} panicked: {message}").into()],
        problems: Vec::new(),
    }
}

/// Runs a finalized plan on a bounded pool of worker threads.
pub struct PlanExecutor {
    executors: Vec<Arc<dyn NodeExecutor>>,
    max_workers: usize,
    fail_fast: bool,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("executors", &self.executors.len())
            .field("max_workers", &self.max_workers)
            .field("fail_fast", &self.fail_fast)
            .finish()
    }
}

impl PlanExecutor {
    /// Executor running tasks and action nodes on `max_workers` threads (at
    /// least one).
    #[must_use]
    pub fn new(max_workers: usize, fail_fast: bool) -> Self {
        Self {
            executors: vec![Arc::new(LocalTaskNodeExecutor), Arc::new(ActionNodeExecutor)],
            max_workers: max_workers.max(1),
            fail_fast,
        }
    }

    /// Consult `executor` before the built-in ones.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executors.insert(0, executor);
        self
    }

    /// Run every node of `plan`.
    ///
    /// Returns once every node reached a final state. Setting `stop` keeps
    /// new nodes from starting; running nodes finish.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::IllegalState` if the plan is not finalized.
    /// Node failures are reported in the result, not as an error.
    pub fn execute(
        &self,
        plan: &ExecutionPlan,
        engine: &ExecutionEngine,
        listeners: &ListenerBroadcast<dyn TaskExecutionListener>,
        stop: &AtomicBool,
    ) -> Result<PlanExecutionResult, PlanError> {
        if !plan.is_finalized() {
            return Err(PlanError::IllegalState(
                "execution plan must be finalized before it is executed".to_string(),
            ));
        }
        let started = Instant::now();
        let detector = MissingTaskDependencyDetector::new();
        let priorities = priorities(plan);
        let workers = self.max_workers.min(plan.len()).max(1);
        info!(nodes = plan.len(), workers, "Executing plan");

        let (job_tx, job_rx) = channel::unbounded::<NodeIndex>();
        let (done_tx, done_rx) = channel::unbounded::<Finished>();

        let result = thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let detector = &detector;
                let _ = thread::Builder::new()
                    .name(format!("plan-worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        for index in &job_rx {
                            // A panicking node must still report back or the coordinator waits forever
                            let finished = panic::catch_unwind(AssertUnwindSafe(|| {
                                self.run_node(plan, engine, detector, listeners, index)
                            }))
                            .unwrap_or_else(|payload| panicked(plan.node(index), payload.as_ref()));
                            if done_tx.send(finished).is_err() {
                                break;
                            }
                        }
                    });
            }
            drop(done_tx);

            let result = self.coordinate(plan, &priorities, workers, (&job_tx, &done_rx), stop);
            drop(job_tx);
            result
        });

        info!(
            elapsed_ms = started.elapsed().as_millis(),
            failures = result.failures.len(),
            "Plan execution finished"
        );
        Ok(result)
    }

    fn coordinate(
        &self,
        plan: &ExecutionPlan,
        priorities: &[NodePriority],
        workers: usize,
        (jobs, done): (&channel::Sender<NodeIndex>, &channel::Receiver<Finished>),
        stop: &AtomicBool,
    ) -> PlanExecutionResult {
        let mut states: Vec<Option<NodeState>> = vec![None; plan.len()];
        let mut waiting_for: Vec<usize> = plan
            .nodes()
            .iter()
            .map(|node| node.all_successors().count())
            .collect();
        let mut ready: BinaryHeap<ReadyNode> = plan
            .nodes()
            .iter()
            .filter(|node| waiting_for[node.index().index()] == 0)
            .map(|node| ReadyNode {
                priority: priorities[node.index().index()],
                index: node.index(),
            })
            .collect();
        let mut result = PlanExecutionResult::default();
        let mut in_flight = 0usize;

        loop {
            while let Some(next) = ready.pop() {
                let node = plan.node(next.index);
                let stopping = stop.load(Ordering::SeqCst) || (self.fail_fast && !result.failures.is_empty());
                match decide(node, &states, stopping) {
                    Decision::Skip(state) => {
                        debug!(node = %node.name(), %state, "Skipping node");
                        complete(plan, priorities, next.index, state, &mut states, &mut waiting_for, &mut ready);
                    }
                    Decision::Run if in_flight < workers => {
                        if jobs.send(next.index).is_err() {
                            error!(node = %node.name(), "Worker pool is gone");
                            complete(plan, priorities, next.index, NodeState::NotExecuted, &mut states, &mut waiting_for, &mut ready);
                            continue;
                        }
                        result.execution_order.push(node.name().to_string());
                        in_flight += 1;
                    }
                    Decision::Run => {
                        ready.push(next);
                        break;
                    }
                }
            }

            if in_flight == 0 {
                break;
            }
            let Ok(finished) = done.recv() else {
                break;
            };
            in_flight -= 1;
            result.failures.extend(finished.failures);
            result.validation_problems.extend(finished.problems);
            complete(plan, priorities, finished.index, finished.state, &mut states, &mut waiting_for, &mut ready);
        }

        result.states = plan
            .nodes()
            .iter()
            .map(|node| {
                let state = states[node.index().index()].unwrap_or_else(|| {
                    warn!(node = %node.name(), "Node never became ready");
                    NodeState::NotExecuted
                });
                (node.name().to_string(), state)
            })
            .collect();
        result
    }

    fn run_node(
        &self,
        plan: &ExecutionPlan,
        engine: &ExecutionEngine,
        detector: &MissingTaskDependencyDetector,
        listeners: &ListenerBroadcast<dyn TaskExecutionListener>,
        index: NodeIndex,
    ) -> Finished {
        let node = plan.node(index);
        let started = Instant::now();
        let mut failures: Vec<BoxError> = Vec::new();
        let mut context = NodeExecutionContext {
            engine,
            plan,
            detector,
            problems: Vec::new(),
        };
        info!(node = %node.name(), "> {node}");

        let mut state = match listeners.dispatch(|listener| listener.before_execute(node.name())) {
            Err(err) => {
                failures.push(Box::new(PlanError::from(err)));
                NodeState::Failed
            }
            Ok(()) => {
                let outcome = self
                    .executors
                    .iter()
                    .find_map(|executor| executor.execute(node, &mut context))
                    .unwrap_or_else(|| Err(format!("No executor can run {node}").into()));
                match outcome {
                    Ok(outcome) => NodeState::Executed(outcome),
                    Err(err) => {
                        failures.push(err);
                        NodeState::Failed
                    }
                }
            }
        };

        if let Err(err) = listeners.dispatch(|listener| listener.after_execute(node.name(), &state)) {
            failures.push(Box::new(PlanError::from(err)));
            state = NodeState::Failed;
        }

        let elapsed_ms = started.elapsed().as_millis();
        if state == NodeState::Failed {
            for failure in &failures {
                error!(node = %node.name(), elapsed_ms, error = %failure, "{node} FAILED");
            }
        } else {
            info!(node = %node.name(), elapsed_ms, "{node} {state}");
        }
        Finished {
            index,
            state,
            failures,
            problems: context.problems,
        }
    }
}

fn decide(node: &Node, states: &[Option<NodeState>], stopping: bool) -> Decision {
    if stopping {
        return Decision::Skip(NodeState::NotExecuted);
    }
    let state_of = |index: &NodeIndex| states[index.index()].unwrap_or(NodeState::NotExecuted);
    if node
        .dependency_successors()
        .iter()
        .any(|dependency| !state_of(dependency).is_success())
    {
        return Decision::Skip(NodeState::NotExecuted);
    }
    if !node.is_required()
        && !node
            .finalizing_successors()
            .iter()
            .any(|finalized| state_of(finalized).did_execute())
    {
        return Decision::Skip(NodeState::NotExecuted);
    }
    if !node.is_enabled() {
        return Decision::Skip(NodeState::Disabled);
    }
    Decision::Run
}

fn complete(
    plan: &ExecutionPlan,
    priorities: &[NodePriority],
    index: NodeIndex,
    state: NodeState,
    states: &mut [Option<NodeState>],
    waiting_for: &mut [usize],
    ready: &mut BinaryHeap<ReadyNode>,
) {
    states[index.index()] = Some(state);
    for &dependent in plan.node(index).dependents() {
        let remaining = &mut waiting_for[dependent.index()];
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            ready.push(ReadyNode {
                priority: priorities[dependent.index()],
                index: dependent,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::task::{ActionNodeDefinition, TaskContainer, TaskDefinition};
    use crate::work::FnWork;
    use crate::work::history::InMemoryExecutionHistoryStore;
    use crate::work::workspace::FixedWorkspaceProvider;
    use convenient_vfs::{DefaultFileHasher, FileSystemAccess, VirtualFileSystem};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn engine(root: &std::path::Path) -> ExecutionEngine {
        ExecutionEngine::new(
            Arc::new(FileSystemAccess::new(
                Arc::new(VirtualFileSystem::new()),
                Arc::new(DefaultFileHasher),
            )),
            Arc::new(InMemoryExecutionHistoryStore::new()),
            Arc::new(FixedWorkspaceProvider::new(root.join("workspace"))),
        )
    }

    fn recording(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<FnWork> {
        let log = Arc::clone(log);
        let label = name.to_string();
        Arc::new(FnWork::new(name, move |_| {
            log.lock().push(label.clone());
            if fail {
                Err(format!("{label} broke").into())
            } else {
                Ok(crate::work::WorkResult::DidWork)
            }
        }))
    }

    fn run(
        container: TaskContainer,
        entries: &[&str],
        executor: &PlanExecutor,
        stop: &AtomicBool,
    ) -> PlanExecutionResult {
        let temp = TempDir::new().unwrap();
        let mut plan = ExecutionPlan::new(Arc::new(container));
        let _ = plan.add_entry_tasks(entries).unwrap();
        plan.finalize_plan().unwrap();
        let listeners = ListenerBroadcast::<dyn TaskExecutionListener>::new("task execution listener");
        executor
            .execute(&plan, &engine(temp.path()), &listeners, stop)
            .unwrap()
    }

    #[test]
    fn test_dependencies_run_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut container = TaskContainer::new();
        container
            .register(TaskDefinition::new(":compile").work(recording(":compile", &log, false)))
            .unwrap();
        container
            .register(
                TaskDefinition::new(":jar")
                    .depends_on(":compile")
                    .work(recording(":jar", &log, false)),
            )
            .unwrap();
        let result = run(container, &[":jar"], &PlanExecutor::new(4, false), &AtomicBool::new(false));
        assert!(result.is_success());
        assert_eq!(*log.lock(), [":compile", ":jar"]);
        assert_eq!(result.execution_order, [":compile", ":jar"]);
        assert!(matches!(result.state(":jar"), Some(NodeState::Executed(Some(_)))));
    }

    #[test]
    fn test_failure_skips_dependents_but_not_independent_nodes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut container = TaskContainer::new();
        container
            .register(
                TaskDefinition::new(":compile")
                    .work(recording(":compile", &log, true))
                    .finalized_by(":report"),
            )
            .unwrap();
        container
            .register(
                TaskDefinition::new(":jar")
                    .depends_on(":compile")
                    .work(recording(":jar", &log, false)),
            )
            .unwrap();
        container
            .register(TaskDefinition::new(":docs").work(recording(":docs", &log, false)))
            .unwrap();
        container
            .register(TaskDefinition::new(":report").work(recording(":report", &log, false)))
            .unwrap();

        let result = run(
            container,
            &[":jar", ":docs"],
            &PlanExecutor::new(1, false),
            &AtomicBool::new(false),
        );
        assert_eq!(result.state(":compile"), Some(NodeState::Failed));
        assert_eq!(result.state(":jar"), Some(NodeState::NotExecuted));
        assert!(result.state(":docs").unwrap().is_success());
        assert!(result.state(":report").unwrap().is_success());
        assert_eq!(result.failures.len(), 1);
        let failure = result.into_result().unwrap_err();
        assert_eq!(failure.to_string(), "Execution failed for :compile.");
    }

    #[test]
    fn test_fail_fast_stops_starting_nodes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut container = TaskContainer::new();
        container
            .register(TaskDefinition::new(":a").work(recording(":a", &log, true)))
            .unwrap();
        container
            .register(TaskDefinition::new(":b").must_run_after(":a").work(recording(":b", &log, false)))
            .unwrap();
        let result = run(container, &[":a", ":b"], &PlanExecutor::new(2, true), &AtomicBool::new(false));
        assert_eq!(*log.lock(), [":a"]);
        assert_eq!(result.state(":b"), Some(NodeState::NotExecuted));
    }

    #[test]
    fn test_stop_prevents_new_nodes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut container = TaskContainer::new();
        container
            .register(TaskDefinition::new(":a").work(recording(":a", &log, false)))
            .unwrap();
        let result = run(container, &[":a"], &PlanExecutor::new(2, false), &AtomicBool::new(true));
        assert!(log.lock().is_empty());
        assert_eq!(result.state(":a"), Some(NodeState::NotExecuted));
        assert!(result.is_success());
    }

    #[test]
    fn test_disabled_and_finalizer_only_nodes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut container = TaskContainer::new();
        container
            .register(
                TaskDefinition::new(":lint")
                    .enabled(false)
                    .finalized_by(":report")
                    .work(recording(":lint", &log, false)),
            )
            .unwrap();
        container
            .register(TaskDefinition::new(":report").work(recording(":report", &log, false)))
            .unwrap();
        container
            .register(
                TaskDefinition::new(":check")
                    .depends_on(":lint")
                    .work(recording(":check", &log, false)),
            )
            .unwrap();
        let result = run(container, &[":check"], &PlanExecutor::new(2, false), &AtomicBool::new(false));
        assert_eq!(result.state(":lint"), Some(NodeState::Disabled));
        assert_eq!(result.state(":report"), Some(NodeState::NotExecuted));
        assert!(result.state(":check").unwrap().did_execute());
        assert_eq!(*log.lock(), [":check"]);
    }

    #[test]
    fn test_action_nodes_and_listener_failures() {
        struct Veto;
        impl TaskExecutionListener for Veto {
            fn before_execute(&self, task: &str) -> Result<(), BoxError> {
                if task == ":blocked" {
                    Err("not allowed".into())
                } else {
                    Ok(())
                }
            }
        }

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut container = TaskContainer::new();
        container
            .register_action(ActionNodeDefinition::new("prepare", move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        container
            .register(TaskDefinition::new(":blocked").depends_on("prepare"))
            .unwrap();

        let temp = TempDir::new().unwrap();
        let mut plan = ExecutionPlan::new(Arc::new(container));
        let _ = plan.add_entry_tasks([":blocked"]).unwrap();
        plan.finalize_plan().unwrap();
        let listeners = ListenerBroadcast::<dyn TaskExecutionListener>::new("task execution listener");
        listeners.add(Arc::new(Veto));
        let result = PlanExecutor::new(2, false)
            .execute(&plan, &engine(temp.path()), &listeners, &AtomicBool::new(false))
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(result.state("prepare"), Some(NodeState::Executed(None)));
        assert_eq!(result.state(":blocked"), Some(NodeState::Failed));
        assert!(result.failures[0].to_string().contains("Failed to notify"));
    }

    #[test]
    fn test_panicking_node_fails_without_hanging() {
        let mut container = TaskContainer::new();
        container
            .register_action(ActionNodeDefinition::new("boom", || panic!("disk on fire")))
            .unwrap();
        container
            .register(TaskDefinition::new(":a").depends_on("boom"))
            .unwrap();
        container.register(TaskDefinition::new(":b")).unwrap();

        let (sender, receiver) = std::sync::mpsc::channel();
        let _ = thread::spawn(move || {
            let result = run(container, &[":a", ":b"], &PlanExecutor::new(2, false), &AtomicBool::new(false));
            let _ = sender.send(result);
        });
        let result = receiver
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("plan execution hung after a node panicked");

        assert_eq!(result.state("boom"), Some(NodeState::Failed));
        assert_eq!(result.state(":a"), Some(NodeState::NotExecuted));
        assert_eq!(result.state(":b"), Some(NodeState::Executed(None)));
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].to_string(), "node 'boom' panicked: disk on fire");
    }

    #[test]
    fn test_unfinalized_plan_is_rejected() {
        let temp = TempDir::new().unwrap();
        let plan = ExecutionPlan::new(Arc::new(TaskContainer::new()));
        let listeners = ListenerBroadcast::<dyn TaskExecutionListener>::new("task execution listener");
        assert!(matches!(
            PlanExecutor::new(1, false).execute(&plan, &engine(temp.path()), &listeners, &AtomicBool::new(false)),
            Err(PlanError::IllegalState(_))
        ));
    }

    #[test]
    fn test_longest_chain_starts_first() {
        let mut container = TaskContainer::new();
        container.register(TaskDefinition::new(":leaf")).unwrap();
        container.register(TaskDefinition::new(":root")).unwrap();
        container
            .register(TaskDefinition::new(":mid").depends_on(":root"))
            .unwrap();
        container
            .register(TaskDefinition::new(":top").depends_on(":mid"))
            .unwrap();
        let result = run(
            container,
            &[":leaf", ":top"],
            &PlanExecutor::new(1, false),
            &AtomicBool::new(false),
        );
        assert_eq!(result.execution_order, [":root", ":mid", ":leaf", ":top"]);
    }
}
