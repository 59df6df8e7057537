//! Decides whether a unit of work runs, loads from cache or is skipped,
//! and records what it produced.

use crate::error::{BoxError, ExecutionError, Result};
use crate::validation::{ValidationProblem, ValidationProblemId, WorkValidationContext};
use crate::work::build_cache::{LocalBuildCache, remove_location};
use crate::work::caching::{
    BeforeExecutionState, CachingDisabledReason, CachingDisabledReasonCategory, CachingState,
};
use crate::work::fingerprint::{FileCollectionFingerprint, PathNormalizer};
use crate::work::history::{ExecutionHistoryStore, PreviousExecutionState};
use crate::work::overlap::{OutputRegistry, OverlappingOutputs};
use crate::work::value::{ImplementationSnapshot, ValueSnapshot};
use crate::work::workspace::WorkspaceProvider;
use crate::work::{
    ExecutionRequest, FileInput, Identity, InputChanges, InputProperties, OutputProperties,
    OverlappingOutputHandling, UnitOfWork, WorkResult,
};
use convenient_vfs::FileSystemAccess;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// How a unit of work was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Nothing changed since the last successful execution.
    UpToDate,
    /// Outputs were restored from the build cache.
    FromCache,
    /// The work ran.
    Executed(WorkResult),
}

impl ExecutionOutcome {
    /// Whether the work ran and had an effect.
    #[must_use]
    pub fn did_work(self) -> bool {
        matches!(self, Self::Executed(WorkResult::DidWork))
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => f.write_str("UP-TO-DATE"),
            Self::FromCache => f.write_str("FROM-CACHE"),
            Self::Executed(WorkResult::DidWork) => f.write_str("EXECUTED"),
            Self::Executed(WorkResult::DidNoWork) => f.write_str("NO-SOURCE"),
        }
    }
}

/// Result of bringing one unit of work up to date.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// What happened.
    pub outcome: ExecutionOutcome,
    /// Cacheability as determined before execution.
    pub caching_state: CachingState,
    /// Identity of the work.
    pub identity: Identity,
    /// Workspace the work was given.
    pub workspace: PathBuf,
    /// Warnings recorded while preparing the work.
    pub problems: Vec<ValidationProblem>,
    /// Why the work was not up to date; empty when it was.
    pub out_of_date_reasons: Vec<String>,
}

struct Fingerprinted {
    values: BTreeMap<String, ValueSnapshot>,
    files: BTreeMap<String, FileCollectionFingerprint>,
    unreadable: bool,
}

/// Runs units of work incrementally.
///
/// One engine is shared by every node of a build; the output registry it
/// keeps is what overlap detection compares against.
pub struct ExecutionEngine {
    fs: Arc<FileSystemAccess>,
    history: Arc<dyn ExecutionHistoryStore>,
    workspaces: Arc<dyn WorkspaceProvider>,
    build_cache: Option<Arc<LocalBuildCache>>,
    outputs: OutputRegistry,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("build_cache", &self.build_cache)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Engine without a build cache.
    #[must_use]
    pub fn new(
        fs: Arc<FileSystemAccess>,
        history: Arc<dyn ExecutionHistoryStore>,
        workspaces: Arc<dyn WorkspaceProvider>,
    ) -> Self {
        Self {
            fs,
            history,
            workspaces,
            build_cache: None,
            outputs: OutputRegistry::new(),
        }
    }

    /// Store and load outputs in `cache`.
    #[must_use]
    pub fn with_build_cache(mut self, cache: Arc<LocalBuildCache>) -> Self {
        self.build_cache = Some(cache);
        self
    }

    /// File system access used for every snapshot.
    #[must_use]
    pub fn file_system(&self) -> &Arc<FileSystemAccess> {
        &self.fs
    }

    /// Outputs recorded so far.
    #[must_use]
    pub fn output_registry(&self) -> &OutputRegistry {
        &self.outputs
    }

    /// Bring `work` up to date.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Validation` if validation reported errors,
    /// `ExecutionError::UnresolvableInput` for inputs the work does not
    /// tolerate being unreadable, `ExecutionError::WorkFailed` or
    /// `ExecutionError::Timeout` if the work failed, and propagates history
    /// and file system failures.
    #[instrument(level = "debug", skip_all, fields(work = %work.display_name()))]
    pub fn execute(&self, work: &dyn UnitOfWork) -> Result<ExecutionResult> {
        let display_name = work.display_name();
        let mut context = WorkValidationContext::new();

        let mut identity_inputs = InputProperties::default();
        work.visit_identity_inputs(&mut identity_inputs);
        let identity_fingerprints = self.fingerprint(work, &identity_inputs, &mut context)?;
        let identity = work.identify(&identity_fingerprints.values, &identity_fingerprints.files);
        let workspace = self.workspaces.workspace_for(&identity)?;

        work.validate(&mut context);
        if context.has_errors() {
            return Err(ExecutionError::Validation {
                work: display_name,
                problems: context.render_errors(),
            });
        }

        let previous = self.history.load(identity.unique_id())?;

        let mut regular_inputs = InputProperties::default();
        work.visit_regular_inputs(&mut regular_inputs);
        let regular_fingerprints = self.fingerprint(work, &regular_inputs, &mut context)?;
        let unreadable = identity_fingerprints.unreadable || regular_fingerprints.unreadable;

        let mut outputs = OutputProperties::default();
        work.visit_outputs(&workspace, &mut outputs);
        let mut output_snapshots = BTreeMap::new();
        for output in outputs.properties() {
            let snapshot = self.fs.read(&output.root)?;
            let _ = output_snapshots.insert(
                output.name.clone(),
                FileCollectionFingerprint::from_snapshots(&[snapshot], PathNormalizer::AbsolutePath),
            );
        }

        let mut implementations = Vec::new();
        work.visit_implementations(&mut implementations);
        let mut implementations = implementations.into_iter();
        let implementation = implementations
            .next()
            .unwrap_or_else(|| ImplementationSnapshot::unknown(display_name.clone()));

        let mut input_properties = identity_fingerprints.values;
        input_properties.extend(regular_fingerprints.values);
        let mut input_file_properties = identity_fingerprints.files;
        input_file_properties.extend(regular_fingerprints.files);
        let before = BeforeExecutionState {
            implementation,
            additional_implementations: implementations.collect(),
            input_properties,
            input_file_properties,
            output_file_location_snapshots: output_snapshots,
        };

        let overlapping = match work.overlapping_output_handling() {
            OverlappingOutputHandling::DetectOverlaps => self.outputs.detect(
                &display_name,
                outputs.properties().iter().map(|o| (o.name.as_str(), o.root.as_path())),
            ),
            OverlappingOutputHandling::IgnoreOverlaps => None,
        };
        let caching_state = self.caching_state(work, &outputs, overlapping.as_ref(), unreadable, before);

        let out_of_date_reasons = match (&previous, caching_state.before_execution_state()) {
            (_, None) => vec!["Inputs could not be read".to_string()],
            (None, Some(_)) => vec!["No history is available.".to_string()],
            (Some(previous), Some(before)) => out_of_date_reasons(previous, before),
        };
        if out_of_date_reasons.is_empty() {
            info!(work = %display_name, "Skipping as it is up to date");
            self.outputs.record(&display_name, outputs.roots());
            return Ok(ExecutionResult {
                outcome: ExecutionOutcome::UpToDate,
                caching_state,
                identity,
                workspace,
                problems: context.into_problems(),
                out_of_date_reasons,
            });
        }
        for reason in &out_of_date_reasons {
            debug!(work = %display_name, reason, "Not up to date");
        }

        if self.load_from_cache(work, &caching_state, &outputs) {
            self.after_execution(&identity, &display_name, &caching_state, &outputs, true, false)?;
            return Ok(ExecutionResult {
                outcome: ExecutionOutcome::FromCache,
                caching_state,
                identity,
                workspace,
                problems: context.into_problems(),
                out_of_date_reasons,
            });
        }

        let input_changes = work
            .input_change_tracking_strategy()
            .requires_input_changes()
            .then(|| input_changes(previous.as_ref(), caching_state.before_execution_state(), &regular_inputs));
        let incremental = input_changes.as_ref().is_some_and(InputChanges::is_incremental);

        if !incremental
            && work.should_cleanup_outputs_on_non_incremental_execution()
            && let Some(previous) = &previous
        {
            self.clean_previous_outputs(&display_name, previous)?;
        }

        let previously_produced = previous.as_ref().map(|p| &p.output_files_produced_by_work);
        let request = ExecutionRequest {
            workspace: &workspace,
            input_changes: input_changes.as_ref(),
            previously_produced_outputs: previously_produced,
        };
        info!(work = %display_name, incremental, "Executing");
        let started = Instant::now();
        let result = self.fs.write(outputs.roots(), || work.execute(&request));
        let elapsed = started.elapsed();

        let outcome = result
            .map_err(|source| ExecutionError::WorkFailed {
                work: display_name.clone(),
                source,
            })
            .and_then(|work_result| match work.timeout() {
                Some(timeout) if elapsed > timeout => Err(ExecutionError::Timeout {
                    work: display_name.clone(),
                    timeout,
                }),
                _ => Ok(work_result),
            });
        self.after_execution(&identity, &display_name, &caching_state, &outputs, outcome.is_ok(), true)?;
        let work_result = outcome.inspect_err(|failure| {
            warn!(work = %display_name, error = %failure, "Execution failed");
        })?;
        debug!(work = %display_name, elapsed_ms = elapsed.as_millis(), "Finished executing");
        Ok(ExecutionResult {
            outcome: ExecutionOutcome::Executed(work_result),
            caching_state,
            identity,
            workspace,
            problems: context.into_problems(),
            out_of_date_reasons,
        })
    }

    fn fingerprint(
        &self,
        work: &dyn UnitOfWork,
        inputs: &InputProperties,
        context: &mut WorkValidationContext,
    ) -> Result<Fingerprinted> {
        let mut files = BTreeMap::new();
        let mut unreadable = false;
        for (property, input) in &inputs.files {
            match self.fingerprint_files(input) {
                Ok(fingerprint) => {
                    let _ = files.insert(property.clone(), fingerprint);
                }
                Err(source) => {
                    let reason = source.to_string();
                    work.handle_unreadable_inputs(ExecutionError::UnresolvableInput {
                        work: work.display_name(),
                        property: property.clone(),
                        source,
                    })?;
                    context.visit_problem(
                        ValidationProblem::warning(
                            ValidationProblemId::UnresolvableInput,
                            work.display_name(),
                            "cannot be resolved",
                        )
                        .for_property(property.clone())
                        .happens_because(reason)
                        .with_solution("Make sure the input can be read before the work executes"),
                    );
                    unreadable = true;
                }
            }
        }
        Ok(Fingerprinted {
            values: inputs.values.clone(),
            files,
            unreadable,
        })
    }

    fn fingerprint_files(&self, input: &FileInput) -> std::result::Result<FileCollectionFingerprint, BoxError> {
        let mut snapshots = Vec::new();
        for root in input.resolve()? {
            if let Some(snapshot) = self.fs.read_filtered(&root, &input.filter)? {
                snapshots.push(snapshot);
            }
        }
        Ok(FileCollectionFingerprint::from_snapshots(&snapshots, input.normalizer))
    }

    fn caching_state(
        &self,
        work: &dyn UnitOfWork,
        outputs: &OutputProperties,
        overlapping: Option<&OverlappingOutputs>,
        unreadable: bool,
        before: BeforeExecutionState,
    ) -> CachingState {
        if unreadable {
            return CachingState::disabled_without_inputs(CachingDisabledReason::new(
                CachingDisabledReasonCategory::UnreadableInputs,
                "Some inputs could not be read",
            ));
        }
        let mut reasons = Vec::new();
        if self.build_cache.is_none() {
            reasons.push(CachingDisabledReason::new(
                CachingDisabledReasonCategory::BuildCacheDisabled,
                "Build cache is disabled",
            ));
        }
        if outputs.is_empty() {
            reasons.push(CachingDisabledReason::new(
                CachingDisabledReasonCategory::NoOutputsDeclared,
                "No outputs declared",
            ));
        }
        if let Some(reason) = work.should_disable_caching(overlapping) {
            reasons.push(reason);
        } else if let Some(overlap) = overlapping {
            reasons.push(CachingDisabledReason::new(
                CachingDisabledReasonCategory::OverlappingOutputs,
                overlap.to_string(),
            ));
        }
        CachingState::from_reasons(reasons, before)
    }

    fn load_from_cache(&self, work: &dyn UnitOfWork, caching_state: &CachingState, outputs: &OutputProperties) -> bool {
        let (Some(cache), CachingState::Enabled { key, .. }) = (&self.build_cache, caching_state) else {
            return false;
        };
        if !work.is_allowed_to_load_from_cache() {
            return false;
        }
        match self.fs.write(outputs.roots(), || cache.load(key, outputs.properties())) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(work = %work.display_name(), key = %key, error = %err, "Could not load from build cache, executing instead");
                false
            }
        }
    }

    fn clean_previous_outputs(&self, display_name: &str, previous: &PreviousExecutionState) -> Result<()> {
        let stale: Vec<PathBuf> = previous
            .output_files_produced_by_work
            .values()
            .flat_map(|fingerprint| fingerprint.regular_files().map(PathBuf::from))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        debug!(work = display_name, files = stale.len(), "Removing outputs of the previous execution");
        self.fs.write(&stale, || stale.iter().try_for_each(|file| remove_location(file)))
    }

    fn after_execution(
        &self,
        identity: &Identity,
        display_name: &str,
        caching_state: &CachingState,
        outputs: &OutputProperties,
        successful: bool,
        store_in_cache: bool,
    ) -> Result<()> {
        let mut produced = BTreeMap::new();
        for output in outputs.properties() {
            let snapshot = self.fs.read(&output.root)?;
            let _ = produced.insert(
                output.name.clone(),
                FileCollectionFingerprint::from_snapshots(&[snapshot], PathNormalizer::AbsolutePath),
            );
        }
        if let Some(before) = caching_state.before_execution_state() {
            self.history.store(
                identity.unique_id(),
                PreviousExecutionState {
                    implementation: before.implementation.clone(),
                    additional_implementations: before.additional_implementations.clone(),
                    input_properties: before.input_properties.clone(),
                    input_file_properties: before.input_file_properties.clone(),
                    output_files_produced_by_work: produced,
                    successful,
                },
            )?;
        } else {
            self.history.remove(identity.unique_id())?;
        }
        if successful
            && store_in_cache
            && let (Some(cache), CachingState::Enabled { key, .. }) = (&self.build_cache, caching_state)
            && let Err(err) = cache.store(key, outputs.properties())
        {
            warn!(work = display_name, key = %key, error = %err, "Could not store outputs in build cache");
        }
        self.outputs.record(display_name, outputs.roots());
        Ok(())
    }
}

fn out_of_date_reasons(previous: &PreviousExecutionState, current: &BeforeExecutionState) -> Vec<String> {
    let mut reasons = Vec::new();
    if !previous.successful {
        reasons.push("The previous execution failed.".to_string());
    }
    if previous.implementation != current.implementation
        || previous.additional_implementations != current.additional_implementations
    {
        reasons.push(format!("The implementation has changed to {}.", current.implementation));
    }
    let names = previous
        .input_properties
        .keys()
        .chain(current.input_properties.keys())
        .collect::<std::collections::BTreeSet<_>>();
    for name in names {
        match (previous.input_properties.get(name), current.input_properties.get(name)) {
            (Some(a), Some(b)) if a == b => {}
            (Some(_), Some(_)) => reasons.push(format!("Value of input property '{name}' has changed.")),
            (None, Some(_)) => reasons.push(format!("Input property '{name}' has been added.")),
            (Some(_), None) => reasons.push(format!("Input property '{name}' has been removed.")),
            (None, None) => {}
        }
    }
    let names = previous
        .input_file_properties
        .keys()
        .chain(current.input_file_properties.keys())
        .collect::<std::collections::BTreeSet<_>>();
    for name in names {
        let before = previous.input_file_properties.get(name).map(FileCollectionFingerprint::hash);
        let now = current.input_file_properties.get(name).map(FileCollectionFingerprint::hash);
        if before != now {
            reasons.push(format!("Input files of property '{name}' have changed."));
        }
    }
    for (name, now) in &current.output_file_location_snapshots {
        match previous.output_files_produced_by_work.get(name) {
            Some(before) if before.hash() == now.hash() => {}
            Some(_) => reasons.push(format!("Output property '{name}' has changed.")),
            None => reasons.push(format!("Output property '{name}' has been added.")),
        }
    }
    for name in previous.output_files_produced_by_work.keys() {
        if !current.output_file_location_snapshots.contains_key(name) {
            reasons.push(format!("Output property '{name}' has been removed."));
        }
    }
    reasons
}

/// Changes of incremental file inputs; everything is reported as added
/// unless the previous execution succeeded with the same implementation
/// and value inputs.
fn input_changes(
    previous: Option<&PreviousExecutionState>,
    current: Option<&BeforeExecutionState>,
    regular_inputs: &InputProperties,
) -> InputChanges {
    let Some(current) = current else {
        return InputChanges::non_incremental(BTreeMap::new());
    };
    let incremental_properties = regular_inputs
        .files
        .iter()
        .filter(|(_, input)| input.incremental)
        .map(|(name, _)| name);
    let baseline = previous.filter(|p| {
        p.successful
            && p.implementation == current.implementation
            && p.additional_implementations == current.additional_implementations
            && p.input_properties == current.input_properties
    });
    let mut changes = BTreeMap::new();
    for name in incremental_properties {
        let Some(now) = current.input_file_properties.get(name) else {
            continue;
        };
        let file_changes = match baseline.and_then(|p| p.input_file_properties.get(name)) {
            Some(before) => now.changes_since(before),
            None => now.all_added(),
        };
        let _ = changes.insert(name.clone(), file_changes);
    }
    if baseline.is_some() {
        InputChanges::incremental(changes)
    } else {
        InputChanges::non_incremental(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::FnWork;
    use crate::work::history::InMemoryExecutionHistoryStore;
    use crate::work::workspace::HashedWorkspaceProvider;
    use convenient_filelock::{
        DEFAULT_LOCK_TIMEOUT, DefaultProcessMetaDataProvider, FileLockManager, NoOpContentionHandler,
    };
    use convenient_vfs::{DefaultFileHasher, VirtualFileSystem};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn engine(root: &Path, with_cache: bool) -> ExecutionEngine {
        let fs = Arc::new(FileSystemAccess::new(
            Arc::new(VirtualFileSystem::new()),
            Arc::new(DefaultFileHasher),
        ));
        let engine = ExecutionEngine::new(
            fs,
            Arc::new(InMemoryExecutionHistoryStore::new()),
            Arc::new(HashedWorkspaceProvider::new(root.join("workspaces"))),
        );
        if with_cache {
            let locks = FileLockManager::new(
                Arc::new(DefaultProcessMetaDataProvider),
                DEFAULT_LOCK_TIMEOUT,
                Arc::new(NoOpContentionHandler),
            );
            let cache = LocalBuildCache::open(root.join("cache"), locks).unwrap();
            engine.with_build_cache(Arc::new(cache))
        } else {
            engine
        }
    }

    /// Copies `src` to `out`, counting executions.
    fn copy_work(src: &Path, out: &Path, runs: &Arc<AtomicUsize>, release: i64) -> FnWork {
        let (from, to, runs) = (src.to_path_buf(), out.to_path_buf(), Arc::clone(runs));
        FnWork::new("copy", move |_| {
            let _ = runs.fetch_add(1, Ordering::SeqCst);
            let _ = fs::copy(&from, &to)?;
            Ok(WorkResult::DidWork)
        })
        .implementation("Copy", "1")
        .input_value("release", release)
        .input_files("source", FileInput::paths([src]))
        .output_file("target", out)
    }

    #[test]
    #[traced_test]
    fn test_second_execution_is_up_to_date() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), false);
        let (src, out) = (temp.path().join("in.txt"), temp.path().join("out.txt"));
        fs::write(&src, "hello").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let first = engine.execute(&copy_work(&src, &out, &runs, 17)).unwrap();
        assert_eq!(first.outcome, ExecutionOutcome::Executed(WorkResult::DidWork));
        assert_eq!(first.out_of_date_reasons, vec!["No history is available.".to_string()]);
        assert_eq!(
            first.caching_state.disabled_reasons()[0].category(),
            CachingDisabledReasonCategory::BuildCacheDisabled
        );

        let second = engine.execute(&copy_work(&src, &out, &runs, 17)).unwrap();
        assert_eq!(second.outcome, ExecutionOutcome::UpToDate);
        assert_eq!(second.identity, first.identity);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(logs_contain("up to date"));
    }

    #[test]
    fn test_changed_inputs_and_outputs_rerun() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), false);
        let (src, out) = (temp.path().join("in.txt"), temp.path().join("out.txt"));
        fs::write(&src, "hello").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let _ = engine.execute(&copy_work(&src, &out, &runs, 17)).unwrap();

        engine.file_system().write([&src], || fs::write(&src, "changed")).unwrap();
        let result = engine.execute(&copy_work(&src, &out, &runs, 17)).unwrap();
        assert_eq!(result.out_of_date_reasons, vec!["Input files of property 'source' have changed.".to_string()]);

        let result = engine.execute(&copy_work(&src, &out, &runs, 21)).unwrap();
        assert_eq!(result.out_of_date_reasons, vec!["Value of input property 'release' has changed.".to_string()]);

        engine.file_system().write([&out], || fs::remove_file(&out)).unwrap();
        let result = engine.execute(&copy_work(&src, &out, &runs, 21)).unwrap();
        assert_eq!(result.out_of_date_reasons, vec!["Output property 'target' has changed.".to_string()]);
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(fs::read_to_string(&out).unwrap(), "changed");
    }

    #[test]
    fn test_outputs_are_loaded_from_cache() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), true);
        let (src, out) = (temp.path().join("in.txt"), temp.path().join("out.txt"));
        fs::write(&src, "hello").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let first = engine.execute(&copy_work(&src, &out, &runs, 17)).unwrap();
        assert!(first.caching_state.is_enabled());
        let _ = engine.execute(&copy_work(&src, &out, &runs, 21)).unwrap();

        let third = engine.execute(&copy_work(&src, &out, &runs, 17)).unwrap();
        assert_eq!(third.outcome, ExecutionOutcome::FromCache);
        assert_eq!(third.caching_state.key(), first.caching_state.key());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello");

        let fourth = engine.execute(&copy_work(&src, &out, &runs, 17)).unwrap();
        assert_eq!(fourth.outcome, ExecutionOutcome::UpToDate);
    }

    #[test]
    fn test_failed_execution_is_never_up_to_date() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), false);
        let out = temp.path().join("out.txt");
        let failing = FnWork::new("broken", |_| Err("compilation failed".into()))
            .implementation("Broken", "1")
            .output_file("out", &out);

        let err = engine.execute(&failing).unwrap_err();
        assert_eq!(err.to_string(), "Execution failed for broken.");
        assert_eq!(
            std::error::Error::source(&err).unwrap().to_string(),
            "compilation failed"
        );
        let err = engine.execute(&failing).unwrap_err();
        assert!(matches!(err, ExecutionError::WorkFailed { .. }));
    }

    #[test]
    fn test_timeout_fails_the_work() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), false);
        let slow = FnWork::new("slow", |_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(WorkResult::DidWork)
        })
        .output_file("out", temp.path().join("out"))
        .timeout(Duration::from_millis(1));
        let err = engine.execute(&slow).unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
    }

    #[test]
    fn test_unresolvable_inputs() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), true);
        let unresolvable = || {
            FnWork::new("lint", |_| Ok(WorkResult::DidNoWork))
                .implementation("Lint", "1")
                .input_files(
                    "sources",
                    FileInput::deferred(|| Err("configuration cannot be resolved".into())),
                )
                .output_file("report", temp.path().join("report.txt"))
        };

        let err = engine.execute(&unresolvable()).unwrap_err();
        assert_eq!(err.to_string(), "Cannot resolve input 'sources' of lint");

        let result = engine.execute(&unresolvable().tolerate_unreadable_inputs()).unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Executed(WorkResult::DidNoWork));
        assert_eq!(
            result.caching_state.disabled_reasons()[0].category(),
            CachingDisabledReasonCategory::UnreadableInputs
        );
        assert_eq!(result.problems[0].id, ValidationProblemId::UnresolvableInput);
        assert_eq!(result.problems[0].reason, "configuration cannot be resolved");
    }

    #[test]
    fn test_overlapping_outputs_disable_caching() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), true);
        let shared = temp.path().join("build");
        let writer = |name: &str, file: &str| {
            let target = shared.join(file);
            FnWork::new(name, move |_| {
                fs::create_dir_all(target.parent().unwrap())?;
                fs::write(&target, "x")?;
                Ok(WorkResult::DidWork)
            })
            .implementation(name, "1")
            .output_dir("dir", &shared)
            .detect_overlaps()
        };

        let first = engine.execute(&writer("a", "a.txt")).unwrap();
        assert!(first.caching_state.is_enabled());
        let second = engine.execute(&writer("b", "b.txt")).unwrap();
        let reason = &second.caching_state.disabled_reasons()[0];
        assert_eq!(reason.category(), CachingDisabledReasonCategory::OverlappingOutputs);
        assert!(reason.message().contains("also written by a"));
    }

    #[test]
    fn test_incremental_work_receives_changes() {
        let temp = TempDir::new().unwrap();
        let engine = engine(temp.path(), false);
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("A.java"), "a").unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let work = || {
            let seen = Arc::clone(&seen);
            FnWork::new("compile", move |request| {
                let changes = request.input_changes.unwrap();
                let added = changes.file_changes("sources").map_or(0, |c| c.added.len());
                seen.lock().push((changes.is_incremental(), added));
                Ok(WorkResult::DidWork)
            })
            .implementation("Compile", "1")
            .input_files("sources", FileInput::paths([&src]).incremental())
            .output_dir("classes", temp.path().join("classes"))
            .incremental()
        };

        let _ = engine.execute(&work()).unwrap();
        engine
            .file_system()
            .write([src.join("B.java")], || fs::write(src.join("B.java"), "b"))
            .unwrap();
        let _ = engine.execute(&work()).unwrap();
        assert_eq!(*seen.lock(), vec![(false, 2), (true, 1)]);
    }

    #[test]
    fn test_validation_errors_prevent_execution() {
        struct Invalid;
        impl UnitOfWork for Invalid {
            fn display_name(&self) -> String {
                "invalid".to_string()
            }
            fn visit_outputs(&self, _workspace: &Path, _outputs: &mut OutputProperties) {}
            fn execute(&self, _request: &ExecutionRequest<'_>) -> std::result::Result<WorkResult, BoxError> {
                panic!("must not execute")
            }
            fn validate(&self, context: &mut WorkValidationContext) {
                context.visit_problem(ValidationProblem::error(
                    ValidationProblemId::InvalidWork,
                    "invalid",
                    "has no action",
                ));
            }
        }
        let temp = TempDir::new().unwrap();
        let err = engine(temp.path(), false).execute(&Invalid).unwrap_err();
        assert_eq!(err.to_string(), "Validation failed for invalid:\ninvalid: has no action");
    }
}
