//! Units of work and the engine that decides whether they need to run.
//!
//! A [`UnitOfWork`] declares three kinds of inputs and outputs:
//!
//! - identity inputs, cheap values that name the work
//! - regular inputs (values and file collections) used for up-to-date
//!   checks and the build cache key
//! - output properties, files or directories the work produces
//!
//! The [`ExecutionEngine`] fingerprints all of them and skips the work when
//! nothing changed since the last execution or when the build cache holds
//! its outputs.

pub mod build_cache;
pub mod caching;
pub mod engine;
pub mod fingerprint;
pub mod history;
pub mod overlap;
pub mod value;
pub mod workspace;

use crate::error::BoxError;
use crate::validation::WorkValidationContext;
use crate::work::caching::{CachingDisabledReason, CachingDisabledReasonCategory};
use crate::work::fingerprint::{FileChanges, FileCollectionFingerprint, PathNormalizer};
use crate::work::overlap::OverlappingOutputs;
use crate::work::value::{ImplementationSnapshot, ValueSnapshot, append_bytes};
use convenient_vfs::{HashCode, SnapshottingFilter};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Whether executing the work had any effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkResult {
    /// Outputs were produced or changed.
    DidWork,
    /// Nothing needed doing.
    DidNoWork,
}

/// Whether the work wants to know which input files changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputChangeTrackingStrategy {
    /// Always executes from scratch.
    #[default]
    None,
    /// Receives the changes of file inputs marked incremental.
    IncrementalParameters,
}

impl InputChangeTrackingStrategy {
    /// Whether input changes are computed.
    #[must_use]
    pub fn requires_input_changes(self) -> bool {
        matches!(self, Self::IncrementalParameters)
    }
}

/// Whether outputs are checked against other work items' outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlappingOutputHandling {
    /// Look for other work writing the same locations.
    DetectOverlaps,
    /// Do not check.
    #[default]
    IgnoreOverlaps,
}

/// Shape of an output property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeType {
    /// A single file.
    File,
    /// A directory and everything in it.
    Directory,
}

/// Unique name of a unit of work within a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Identity with the given id.
    #[must_use]
    pub fn new(unique_id: impl Into<String>) -> Self {
        Self(unique_id.into())
    }

    /// Identity derived from identity inputs: the same inputs, in any order
    /// of declaration, always give the same id.
    #[must_use]
    pub fn from_inputs(
        kind: &str,
        values: &BTreeMap<String, ValueSnapshot>,
        files: &BTreeMap<String, FileCollectionFingerprint>,
    ) -> Self {
        let mut hasher = Sha256::new();
        append_bytes(&mut hasher, kind.as_bytes());
        for (name, value) in values {
            append_bytes(&mut hasher, name.as_bytes());
            hasher.update(value.hash().as_bytes());
        }
        for (name, fingerprint) in files {
            append_bytes(&mut hasher, name.as_bytes());
            hasher.update(fingerprint.hash().as_bytes());
        }
        Self(HashCode::from_digest(hasher).to_hex())
    }

    /// The id.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves file input roots when the input is fingerprinted.
pub type FileResolver = Arc<dyn Fn() -> Result<Vec<PathBuf>, BoxError> + Send + Sync>;

/// Where the files of a file input come from.
#[derive(Clone)]
pub enum FileSource {
    /// Fixed roots.
    Paths(Vec<PathBuf>),
    /// Roots computed on demand; resolution may fail.
    Deferred(FileResolver),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paths(paths) => f.debug_tuple("Paths").field(paths).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// A file collection input property.
#[derive(Debug, Clone)]
pub struct FileInput {
    /// Roots of the collection.
    pub source: FileSource,
    /// Applied to directory roots.
    pub filter: SnapshottingFilter,
    /// Path normalization for the fingerprint.
    pub normalizer: PathNormalizer,
    /// Whether changes are reported to incremental work.
    pub incremental: bool,
}

impl FileInput {
    /// Input over fixed `roots`.
    #[must_use]
    pub fn paths(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            source: FileSource::Paths(roots.into_iter().map(Into::into).collect()),
            filter: SnapshottingFilter::empty(),
            normalizer: PathNormalizer::default(),
            incremental: false,
        }
    }

    /// Input whose roots are resolved when fingerprinted.
    #[must_use]
    pub fn deferred(
        resolver: impl Fn() -> Result<Vec<PathBuf>, BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source: FileSource::Deferred(Arc::new(resolver)),
            ..Self::paths(Vec::<PathBuf>::new())
        }
    }

    /// Use `filter` on directory roots.
    #[must_use]
    pub fn with_filter(mut self, filter: SnapshottingFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Use `normalizer` for the fingerprint.
    #[must_use]
    pub fn normalized(mut self, normalizer: PathNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Report changes of this input to incremental work.
    #[must_use]
    pub fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }

    /// Resolve the roots.
    ///
    /// # Errors
    ///
    /// Whatever a deferred resolver reports.
    pub fn resolve(&self) -> Result<Vec<PathBuf>, BoxError> {
        match &self.source {
            FileSource::Paths(paths) => Ok(paths.clone()),
            FileSource::Deferred(resolver) => resolver(),
        }
    }
}

/// Input properties visited on a unit of work.
#[derive(Debug, Clone, Default)]
pub struct InputProperties {
    /// Value inputs by name.
    pub values: BTreeMap<String, ValueSnapshot>,
    /// File inputs by name.
    pub files: BTreeMap<String, FileInput>,
}

impl InputProperties {
    /// Add a value input.
    pub fn visit_value(&mut self, name: impl Into<String>, value: impl Into<ValueSnapshot>) {
        let _ = self.values.insert(name.into(), value.into());
    }

    /// Add a file input.
    pub fn visit_files(&mut self, name: impl Into<String>, input: FileInput) {
        let _ = self.files.insert(name.into(), input);
    }
}

/// A declared output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProperty {
    /// Property name.
    pub name: String,
    /// File or directory.
    pub tree_type: TreeType,
    /// Location.
    pub root: PathBuf,
}

/// Output properties visited on a unit of work.
#[derive(Debug, Clone, Default)]
pub struct OutputProperties {
    properties: Vec<OutputProperty>,
}

impl OutputProperties {
    /// Add an output property.
    pub fn visit_output_property(&mut self, name: impl Into<String>, tree_type: TreeType, root: impl Into<PathBuf>) {
        self.properties.push(OutputProperty {
            name: name.into(),
            tree_type,
            root: root.into(),
        });
    }

    /// Visited properties in declaration order.
    #[must_use]
    pub fn properties(&self) -> &[OutputProperty] {
        &self.properties
    }

    /// Whether nothing was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Output locations.
    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.properties.iter().map(|p| p.root.as_path())
    }
}

/// Changes of incremental file inputs since the last execution.
#[derive(Debug, Clone, Default)]
pub struct InputChanges {
    incremental: bool,
    changes: BTreeMap<String, FileChanges>,
}

impl InputChanges {
    /// Changes for an incremental execution.
    #[must_use]
    pub fn incremental(changes: BTreeMap<String, FileChanges>) -> Self {
        Self {
            incremental: true,
            changes,
        }
    }

    /// Every file reported as added.
    #[must_use]
    pub fn non_incremental(changes: BTreeMap<String, FileChanges>) -> Self {
        Self {
            incremental: false,
            changes,
        }
    }

    /// Whether only changes are reported (otherwise the work should redo
    /// everything).
    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Changes of one incremental file property.
    #[must_use]
    pub fn file_changes(&self, property: &str) -> Option<&FileChanges> {
        self.changes.get(property)
    }
}

/// What a unit of work is given when executed.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    /// Directory allocated to the work.
    pub workspace: &'a Path,
    /// Input changes for incremental work.
    pub input_changes: Option<&'a InputChanges>,
    /// Outputs produced by the previous execution, by property.
    pub previously_produced_outputs: Option<&'a BTreeMap<String, FileCollectionFingerprint>>,
}

/// An executable, cacheable piece of work.
pub trait UnitOfWork: Send + Sync {
    /// Human-readable name.
    fn display_name(&self) -> String;

    /// Identity from the fingerprinted identity inputs.
    fn identify(
        &self,
        identity_inputs: &BTreeMap<String, ValueSnapshot>,
        identity_file_inputs: &BTreeMap<String, FileCollectionFingerprint>,
    ) -> Identity {
        Identity::from_inputs(&self.display_name(), identity_inputs, identity_file_inputs)
    }

    /// Declare identity inputs.
    fn visit_identity_inputs(&self, _inputs: &mut InputProperties) {}

    /// Declare regular inputs.
    fn visit_regular_inputs(&self, _inputs: &mut InputProperties) {}

    /// Declare outputs, possibly inside `workspace`.
    fn visit_outputs(&self, workspace: &Path, outputs: &mut OutputProperties);

    /// Declare the implementations whose code determines the outputs.
    fn visit_implementations(&self, implementations: &mut Vec<ImplementationSnapshot>) {
        implementations.push(ImplementationSnapshot::of::<Self>());
    }

    /// Run the work.
    ///
    /// # Errors
    ///
    /// Any failure of the work.
    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<WorkResult, BoxError>;

    /// Record problems with the work's declaration.
    fn validate(&self, _context: &mut WorkValidationContext) {}

    /// Veto caching, e.g. because outputs overlap.
    fn should_disable_caching(&self, _overlapping: Option<&OverlappingOutputs>) -> Option<CachingDisabledReason> {
        None
    }

    /// Whether outputs may be loaded from the build cache.
    fn is_allowed_to_load_from_cache(&self) -> bool {
        true
    }

    /// Whether to check outputs against other work.
    fn overlapping_output_handling(&self) -> OverlappingOutputHandling {
        OverlappingOutputHandling::IgnoreOverlaps
    }

    /// Whether to compute input changes.
    fn input_change_tracking_strategy(&self) -> InputChangeTrackingStrategy {
        InputChangeTrackingStrategy::None
    }

    /// Whether previous outputs are removed before a non-incremental
    /// execution.
    fn should_cleanup_outputs_on_non_incremental_execution(&self) -> bool {
        true
    }

    /// Maximum execution time.
    ///
    /// Checked once the work returns: work that overran fails with
    /// `ExecutionError::Timeout` and its result is discarded. Work that never
    /// returns is not interrupted.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Called when an input cannot be resolved or read. Returning `Ok`
    /// degrades to "cannot determine up-to-date-ness": the work executes
    /// with caching disabled.
    ///
    /// # Errors
    ///
    /// By default the error is passed on.
    fn handle_unreadable_inputs(&self, error: crate::error::ExecutionError) -> crate::error::Result<()> {
        Err(error)
    }
}

/// Action run by a [`FnWork`].
pub type WorkAction = Arc<dyn Fn(&ExecutionRequest<'_>) -> Result<WorkResult, BoxError> + Send + Sync>;

/// Unit of work assembled from a closure and declared properties.
#[derive(Clone)]
pub struct FnWork {
    name: String,
    identity: InputProperties,
    inputs: InputProperties,
    outputs: Vec<(String, TreeType, PathBuf)>,
    implementation: ImplementationSnapshot,
    cacheable: bool,
    overlaps: OverlappingOutputHandling,
    tracking: InputChangeTrackingStrategy,
    timeout: Option<Duration>,
    tolerate_unreadable_inputs: bool,
    action: WorkAction,
}

impl fmt::Debug for FnWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWork")
            .field("name", &self.name)
            .field("implementation", &self.implementation)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl FnWork {
    /// Work named `name` running `action`. The implementation is unknown
    /// until set, so the work is not cached until then.
    pub fn new(
        name: impl Into<String>,
        action: impl Fn(&ExecutionRequest<'_>) -> Result<WorkResult, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            implementation: ImplementationSnapshot::unknown(name.clone()),
            name,
            identity: InputProperties::default(),
            inputs: InputProperties::default(),
            outputs: Vec::new(),
            cacheable: true,
            overlaps: OverlappingOutputHandling::IgnoreOverlaps,
            tracking: InputChangeTrackingStrategy::None,
            timeout: None,
            tolerate_unreadable_inputs: false,
            action: Arc::new(action),
        }
    }

    /// Identify the implementation as `type_name` at `version`.
    #[must_use]
    pub fn implementation(mut self, type_name: &str, version: &str) -> Self {
        self.implementation = ImplementationSnapshot::new(type_name, version);
        self
    }

    /// Add an identity input.
    #[must_use]
    pub fn identity_input(mut self, name: &str, value: impl Into<ValueSnapshot>) -> Self {
        self.identity.visit_value(name, value);
        self
    }

    /// Add a value input.
    #[must_use]
    pub fn input_value(mut self, name: &str, value: impl Into<ValueSnapshot>) -> Self {
        self.inputs.visit_value(name, value);
        self
    }

    /// Add a file input.
    #[must_use]
    pub fn input_files(mut self, name: &str, input: FileInput) -> Self {
        self.inputs.visit_files(name, input);
        self
    }

    /// Declare an output file.
    #[must_use]
    pub fn output_file(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.outputs.push((name.to_string(), TreeType::File, path.into()));
        self
    }

    /// Declare an output directory.
    #[must_use]
    pub fn output_dir(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.outputs.push((name.to_string(), TreeType::Directory, path.into()));
        self
    }

    /// Never store or load outputs in the build cache.
    #[must_use]
    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Check outputs against other work.
    #[must_use]
    pub fn detect_overlaps(mut self) -> Self {
        self.overlaps = OverlappingOutputHandling::DetectOverlaps;
        self
    }

    /// Receive input changes.
    #[must_use]
    pub fn incremental(mut self) -> Self {
        self.tracking = InputChangeTrackingStrategy::IncrementalParameters;
        self
    }

    /// Fail when running longer than `timeout`. The limit is checked after
    /// the action returns; see [`UnitOfWork::timeout`].
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Execute even if inputs cannot be read.
    #[must_use]
    pub fn tolerate_unreadable_inputs(mut self) -> Self {
        self.tolerate_unreadable_inputs = true;
        self
    }
}

impl UnitOfWork for FnWork {
    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn visit_identity_inputs(&self, inputs: &mut InputProperties) {
        inputs.values.extend(self.identity.values.clone());
        inputs.files.extend(self.identity.files.clone());
    }

    fn visit_regular_inputs(&self, inputs: &mut InputProperties) {
        inputs.values.extend(self.inputs.values.clone());
        inputs.files.extend(self.inputs.files.clone());
    }

    fn visit_outputs(&self, _workspace: &Path, outputs: &mut OutputProperties) {
        for (name, tree_type, root) in &self.outputs {
            outputs.visit_output_property(name.clone(), *tree_type, root.clone());
        }
    }

    fn visit_implementations(&self, implementations: &mut Vec<ImplementationSnapshot>) {
        implementations.push(self.implementation.clone());
    }

    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<WorkResult, BoxError> {
        (self.action)(request)
    }

    fn should_disable_caching(&self, overlapping: Option<&OverlappingOutputs>) -> Option<CachingDisabledReason> {
        if !self.cacheable {
            return Some(CachingDisabledReason::new(
                CachingDisabledReasonCategory::NotCacheable,
                format!("Caching has not been enabled for {}", self.name),
            ));
        }
        overlapping.map(|overlap| {
            CachingDisabledReason::new(
                CachingDisabledReasonCategory::OverlappingOutputs,
                format!(
                    "{overlap}. Caching outputs requires exclusive access to output locations, \
                     so that files produced by one work item are never stored as another's"
                ),
            )
        })
    }

    fn overlapping_output_handling(&self) -> OverlappingOutputHandling {
        self.overlaps
    }

    fn input_change_tracking_strategy(&self) -> InputChangeTrackingStrategy {
        self.tracking
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn handle_unreadable_inputs(&self, error: crate::error::ExecutionError) -> crate::error::Result<()> {
        if self.tolerate_unreadable_inputs {
            tracing::warn!(work = %self.name, error = %error, "Cannot determine whether inputs are up to date");
            Ok(())
        } else {
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_order_independent() {
        let a = BTreeMap::from([
            ("x".to_string(), ValueSnapshot::from(1)),
            ("y".to_string(), ValueSnapshot::from("two")),
        ]);
        let mut b = BTreeMap::new();
        let _ = b.insert("y".to_string(), ValueSnapshot::from("two"));
        let _ = b.insert("x".to_string(), ValueSnapshot::from(1));
        let files = BTreeMap::new();
        assert_eq!(
            Identity::from_inputs("transform", &a, &files),
            Identity::from_inputs("transform", &b, &files)
        );
        let _ = b.insert("x".to_string(), ValueSnapshot::from(2));
        assert_ne!(
            Identity::from_inputs("transform", &a, &files),
            Identity::from_inputs("transform", &b, &files)
        );
    }

    #[test]
    fn test_fn_work_declarations() {
        let work = FnWork::new("compile", |_| Ok(WorkResult::DidWork))
            .implementation("JavaCompile", "1")
            .input_value("release", 17)
            .output_dir("classes", "/out/classes")
            .not_cacheable();

        let mut inputs = InputProperties::default();
        work.visit_regular_inputs(&mut inputs);
        assert_eq!(inputs.values["release"], ValueSnapshot::Integer(17));

        let mut outputs = OutputProperties::default();
        work.visit_outputs(Path::new("/ws"), &mut outputs);
        assert_eq!(outputs.properties()[0].tree_type, TreeType::Directory);

        let reason = work.should_disable_caching(None).unwrap();
        assert_eq!(reason.category(), CachingDisabledReasonCategory::NotCacheable);
    }

    #[test]
    fn test_deferred_input_resolution_errors_propagate() {
        let input = FileInput::deferred(|| Err("configuration not resolvable".into()));
        assert_eq!(
            input.resolve().unwrap_err().to_string(),
            "configuration not resolvable"
        );
        assert_eq!(FileInput::paths(["/a"]).resolve().unwrap(), vec![PathBuf::from("/a")]);
    }
}
