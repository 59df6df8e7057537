//! Drives one build's plan through its lifecycle.
//!
//! ```text
//! DiscoveringTasks --finalize_work_graph--> ReadyToRun --start_execution--> RunningTasks --> Finished
//! ```
//!
//! Every operation is only valid in one state; calling it in another is a
//! programming error reported as `PlanError::IllegalState`.

use crate::cancellation::BuildCancellationToken;
use crate::error::{BuildFailure, PlanError};
use crate::listener::{ListenerBroadcast, TaskExecutionGraphListener, TaskExecutionListener};
use crate::plan::{ExecutionPlan, PlanExecutionResult, PlannedNode, TaskContainer};
use crate::services::BuildServices;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Lifecycle state of a [`BuildController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Tasks are being added.
    DiscoveringTasks,
    /// The graph is final and may be executed.
    ReadyToRun,
    /// The graph is executing.
    RunningTasks,
    /// Execution completed.
    Finished,
}

/// What a build reports when it completes: the plan result when every node
/// succeeded, otherwise all failures in one.
pub type BuildCompletion = Result<PlanExecutionResult, BuildFailure>;

/// A job that runs a whole build.
pub type BuildJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs build jobs somewhere other than the calling thread.
pub trait BuildExecutor {
    /// Run `job`.
    fn execute(&self, job: BuildJob);
}

/// Jobs run on the runtime's blocking pool.
impl BuildExecutor for tokio::runtime::Handle {
    fn execute(&self, job: BuildJob) {
        let _ = self.spawn_blocking(job);
    }
}

/// Every job gets a fresh thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadBuildExecutor;

impl BuildExecutor for ThreadBuildExecutor {
    fn execute(&self, job: BuildJob) {
        // The job is moved into the thread closure; on spawn failure it is
        // gone, so the completion callback must observe the failure instead.
        let job = Arc::new(Mutex::new(Some(job)));
        let spawned = Arc::clone(&job);
        let result = std::thread::Builder::new()
            .name("build".to_string())
            .spawn(move || {
                if let Some(job) = spawned.lock().take() {
                    job();
                }
            });
        if let Err(err) = result {
            error!(error = %err, "Cannot start build thread, running inline");
            if let Some(job) = job.lock().take() {
                job();
            }
        }
    }
}

struct ControllerInner {
    services: Arc<BuildServices>,
    plan: RwLock<ExecutionPlan>,
    state: Mutex<BuildState>,
    queued: Mutex<Vec<String>>,
    scheduled: Mutex<BTreeSet<String>>,
    stop: Arc<AtomicBool>,
    cancellation: BuildCancellationToken,
    task_listeners: ListenerBroadcast<dyn TaskExecutionListener>,
    graph_listeners: ListenerBroadcast<dyn TaskExecutionGraphListener>,
}

/// Controls one build: populating, finalizing and executing its plan.
///
/// Cloning yields another handle to the same build, so `stop` can be called
/// from any thread.
#[derive(Clone)]
pub struct BuildController {
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for BuildController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildController")
            .field("state", &*self.inner.state.lock())
            .field("scheduled", &self.inner.scheduled.lock().len())
            .field("stopped", &self.inner.stop.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BuildController {
    /// Controller for a build over `tasks`. Cancelling `cancellation` stops
    /// the build.
    #[must_use]
    pub fn new(
        services: Arc<BuildServices>,
        tasks: Arc<TaskContainer>,
        cancellation: BuildCancellationToken,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let _ = cancellation.add_callback(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                info!("Stopping build after cancellation");
            }
        });
        Self {
            inner: Arc::new(ControllerInner {
                services,
                plan: RwLock::new(ExecutionPlan::new(tasks)),
                state: Mutex::new(BuildState::DiscoveringTasks),
                queued: Mutex::new(Vec::new()),
                scheduled: Mutex::new(BTreeSet::new()),
                stop,
                cancellation,
                task_listeners: ListenerBroadcast::new("task execution listener"),
                graph_listeners: ListenerBroadcast::new("task execution graph listener"),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BuildState {
        *self.inner.state.lock()
    }

    /// Token that cancels this build.
    #[must_use]
    pub fn cancellation_token(&self) -> &BuildCancellationToken {
        &self.inner.cancellation
    }

    /// Notify `listener` around every task.
    pub fn add_task_listener(&self, listener: Arc<dyn TaskExecutionListener>) {
        self.inner.task_listeners.add(listener);
    }

    /// Notify `listener` once the graph is final.
    pub fn add_graph_listener(&self, listener: Arc<dyn TaskExecutionGraphListener>) {
        self.inner.graph_listeners.add(listener);
    }

    fn expect_state(&self, expected: BuildState, operation: &str) -> Result<(), PlanError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(PlanError::IllegalState(format!(
                "cannot {operation} while {actual:?}, expected {expected:?}"
            )))
        }
    }

    /// Queue tasks to be added by the next
    /// [`BuildController::schedule_queued_tasks`].
    ///
    /// # Errors
    ///
    /// `PlanError::IllegalState` unless tasks are being discovered.
    pub fn queue_for_execution<I>(&self, tasks: I) -> Result<(), PlanError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.expect_state(BuildState::DiscoveringTasks, "queue tasks")?;
        self.inner
            .queued
            .lock()
            .extend(tasks.into_iter().map(Into::into));
        Ok(())
    }

    /// Add requested tasks and everything they pull in to the graph. May be
    /// called repeatedly.
    ///
    /// # Errors
    ///
    /// - `PlanError::Cancelled` if the build was cancelled
    /// - `PlanError::IllegalState` unless tasks are being discovered
    /// - `PlanError::UnknownTask` for an unregistered name
    pub fn populate_work_graph<I>(&self, tasks: I) -> Result<(), PlanError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.inner.cancellation.check()?;
        self.expect_state(BuildState::DiscoveringTasks, "populate the work graph")?;
        let tasks: Vec<String> = tasks.into_iter().map(Into::into).collect();
        let _ = self.inner.plan.write().add_entry_tasks(&tasks)?;
        self.inner.scheduled.lock().extend(tasks);
        Ok(())
    }

    /// Add queued tasks that are not scheduled yet. Returns whether any
    /// task was added.
    ///
    /// # Errors
    ///
    /// - `PlanError::IllegalState` unless tasks are being discovered
    /// - `PlanError::UnknownTask` for an unregistered name; the queue is
    ///   left untouched
    pub fn schedule_queued_tasks(&self) -> Result<bool, PlanError> {
        self.expect_state(BuildState::DiscoveringTasks, "schedule queued tasks")?;
        let mut queued = self.inner.queued.lock();
        let mut scheduled = self.inner.scheduled.lock();
        let new: Vec<String> = queued
            .iter()
            .filter(|task| !scheduled.contains(*task))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !new.is_empty() {
            let _ = self.inner.plan.write().add_entry_tasks(&new)?;
            debug!(tasks = ?new, "Scheduled queued tasks");
        }
        queued.clear();
        let added = !new.is_empty();
        scheduled.extend(new);
        Ok(added)
    }

    /// Check the graph for cycles, fix its order and notify graph
    /// listeners.
    ///
    /// # Errors
    ///
    /// - `PlanError::QueuedTasksNotScheduled` while queued tasks remain
    /// - `PlanError::IllegalState` unless tasks are being discovered
    /// - `PlanError::CircularDependency` if the graph has a cycle
    /// - `PlanError::ListenerNotification` if a graph listener failed; the
    ///   build is then finished and cannot be started
    pub fn finalize_work_graph(&self) -> Result<(), PlanError> {
        self.expect_state(BuildState::DiscoveringTasks, "finalize the work graph")?;
        if !self.inner.queued.lock().is_empty() {
            return Err(PlanError::QueuedTasksNotScheduled);
        }
        let mut plan = self.inner.plan.write();
        plan.finalize_plan()?;
        let plan = parking_lot::RwLockWriteGuard::downgrade(plan);
        let notified = self
            .inner
            .graph_listeners
            .dispatch(|listener| listener.graph_populated(&plan));
        // A build whose listeners rejected the graph never runs
        *self.inner.state.lock() = if notified.is_ok() {
            BuildState::ReadyToRun
        } else {
            BuildState::Finished
        };
        notified?;
        Ok(())
    }

    /// Scheduled nodes in execution order with their successors.
    #[must_use]
    pub fn plan_report(&self) -> Vec<PlannedNode> {
        self.inner.plan.read().report()
    }

    /// Run the graph on `executor` under one worker lease and hand the
    /// outcome to `on_complete`.
    ///
    /// A build cancelled before this call completes with
    /// `PlanError::Cancelled` without running anything.
    ///
    /// # Errors
    ///
    /// `PlanError::IllegalState` unless the graph is finalized and not
    /// started yet; `on_complete` is not called in that case.
    pub fn start_execution(
        &self,
        executor: &dyn BuildExecutor,
        on_complete: impl FnOnce(BuildCompletion) + Send + 'static,
    ) -> Result<(), PlanError> {
        {
            let mut state = self.inner.state.lock();
            if *state != BuildState::ReadyToRun {
                return Err(PlanError::IllegalState(format!(
                    "cannot start execution while {:?}, expected {:?}",
                    *state,
                    BuildState::ReadyToRun
                )));
            }
            *state = BuildState::RunningTasks;
        }

        let inner = Arc::clone(&self.inner);
        executor.execute(Box::new(move || {
            let completion = inner
                .services
                .leases()
                .run_as_worker_thread(|| inner.run());
            *inner.state.lock() = BuildState::Finished;
            match &completion {
                Ok(result) => info!(nodes = result.states.len(), "BUILD SUCCESSFUL"),
                Err(failure) => error!(failures = failure.causes().len(), "BUILD FAILED"),
            }
            on_complete(completion);
        }));
        Ok(())
    }

    /// Start execution on `executor` and wait for it to complete.
    ///
    /// # Errors
    ///
    /// Lifecycle errors and node failures, aggregated into one
    /// [`BuildFailure`].
    pub async fn run_to_completion(&self, executor: &dyn BuildExecutor) -> BuildCompletion {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        self.start_execution(executor, move |completion| {
            let _ = sender.send(completion);
        })?;
        receiver.await.map_err(|_| {
            BuildFailure::new(vec!["build finished without reporting an outcome".into()])
        })?
    }

    /// Keep nodes that have not started from starting. Running nodes
    /// finish. Safe to call repeatedly and from any thread.
    pub fn stop(&self) {
        if !self.inner.stop.swap(true, Ordering::SeqCst) {
            info!("Stop requested; no further tasks will start");
        }
    }

    /// Whether [`BuildController::stop`] was called or the build cancelled.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }
}

impl ControllerInner {
    fn run(&self) -> BuildCompletion {
        self.cancellation.check()?;
        self.services.build_started();
        let plan = self.plan.read();
        let executed = self.services.plan_executor().execute(
            &plan,
            self.services.engine(),
            &self.task_listeners,
            &self.stop,
        );
        self.services.build_finished();
        let result = executed?;
        if result.failures.is_empty() {
            Ok(result)
        } else {
            Err(BuildFailure::new(result.failures))
        }
    }
}
