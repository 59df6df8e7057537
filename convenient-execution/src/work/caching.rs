//! Cacheability of a unit of work.

use crate::work::fingerprint::FileCollectionFingerprint;
use crate::work::value::{ImplementationSnapshot, ValueSnapshot, append_bytes};
use convenient_vfs::HashCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Why caching is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachingDisabledReasonCategory {
    /// Cacheability was not determined.
    Unknown,
    /// The build cache is switched off.
    BuildCacheDisabled,
    /// The work said it is not cacheable.
    NotCacheable,
    /// Another work item writes to the same locations.
    OverlappingOutputs,
    /// The work's implementation cannot be identified.
    NonCacheableImplementation,
    /// Nothing to store.
    NoOutputsDeclared,
    /// Some inputs could not be fingerprinted.
    UnreadableInputs,
}

/// Category plus human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingDisabledReason {
    category: CachingDisabledReasonCategory,
    message: String,
}

impl CachingDisabledReason {
    /// Reason in `category` explained by `message`.
    #[must_use]
    pub fn new(category: CachingDisabledReasonCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Category of the reason.
    #[must_use]
    pub fn category(&self) -> CachingDisabledReasonCategory {
        self.category
    }

    /// Explanation.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CachingDisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Key of a build cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildCacheKey(HashCode);

impl BuildCacheKey {
    /// Hex rendering, used as the entry name.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Underlying hash.
    #[must_use]
    pub fn hash_code(&self) -> HashCode {
        self.0
    }
}

impl fmt::Display for BuildCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

/// Everything known about a unit of work before it executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeforeExecutionState {
    /// Implementation of the work itself.
    pub implementation: ImplementationSnapshot,
    /// Further implementations the work delegates to.
    pub additional_implementations: Vec<ImplementationSnapshot>,
    /// Identity and regular value inputs by property name.
    pub input_properties: BTreeMap<String, ValueSnapshot>,
    /// Identity and regular file inputs by property name.
    pub input_file_properties: BTreeMap<String, FileCollectionFingerprint>,
    /// Output locations as found before executing.
    pub output_file_location_snapshots: BTreeMap<String, FileCollectionFingerprint>,
}

impl BeforeExecutionState {
    /// Cache key over implementations, inputs and output property names.
    ///
    /// Output contents do not take part: the key says which outputs the
    /// work would produce, not what is currently on disk.
    #[must_use]
    pub fn cache_key(&self) -> BuildCacheKey {
        let mut hasher = Sha256::new_with_prefix(b"BUILD_CACHE_KEY");
        append_implementation(&mut hasher, &self.implementation);
        for implementation in &self.additional_implementations {
            append_implementation(&mut hasher, implementation);
        }
        for (name, value) in &self.input_properties {
            append_bytes(&mut hasher, name.as_bytes());
            hasher.update(value.hash().as_bytes());
        }
        for (name, fingerprint) in &self.input_file_properties {
            append_bytes(&mut hasher, name.as_bytes());
            hasher.update(fingerprint.hash().as_bytes());
        }
        for name in self.output_file_location_snapshots.keys() {
            append_bytes(&mut hasher, name.as_bytes());
        }
        BuildCacheKey(HashCode::from_digest(hasher))
    }

    /// Whether every implementation can be identified.
    #[must_use]
    pub fn has_known_implementations(&self) -> bool {
        self.implementation.is_known()
            && self
                .additional_implementations
                .iter()
                .all(ImplementationSnapshot::is_known)
    }
}

fn append_implementation(hasher: &mut Sha256, implementation: &ImplementationSnapshot) {
    append_bytes(hasher, implementation.type_name().as_bytes());
    match implementation.hash() {
        Some(hash) => hasher.update(hash.as_bytes()),
        None => hasher.update([0u8]),
    }
}

/// Whether the outputs of a unit of work may be stored in and loaded from
/// the build cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachingState {
    /// Caching is possible under `key`.
    Enabled {
        /// Cache key.
        key: BuildCacheKey,
        /// State the key was computed from.
        before_execution_state: BeforeExecutionState,
    },
    /// Caching is not possible.
    Disabled {
        /// At least one reason.
        reasons: Vec<CachingDisabledReason>,
        /// Key, if inputs could be fingerprinted.
        key: Option<BuildCacheKey>,
        /// Inputs, if they could be fingerprinted.
        before_execution_state: Option<BeforeExecutionState>,
    },
}

impl CachingState {
    /// State before anything was determined.
    #[must_use]
    pub fn not_determined() -> Self {
        Self::disabled_without_inputs(CachingDisabledReason::new(
            CachingDisabledReasonCategory::Unknown,
            "Cacheability was not determined",
        ))
    }

    /// Disabled for `reason`, with no inputs known.
    #[must_use]
    pub fn disabled_without_inputs(reason: CachingDisabledReason) -> Self {
        Self::Disabled {
            reasons: vec![reason],
            key: None,
            before_execution_state: None,
        }
    }

    /// Caching state for `before`, disabled if there is any reason.
    ///
    /// An implementation that cannot be identified adds its own reason.
    #[must_use]
    pub fn from_reasons(mut reasons: Vec<CachingDisabledReason>, before: BeforeExecutionState) -> Self {
        if !before.has_known_implementations() {
            reasons.push(CachingDisabledReason::new(
                CachingDisabledReasonCategory::NonCacheableImplementation,
                format!("Implementation of {} is unknown", before.implementation.type_name()),
            ));
        }
        let key = before.cache_key();
        if reasons.is_empty() {
            Self::Enabled {
                key,
                before_execution_state: before,
            }
        } else {
            Self::Disabled {
                reasons,
                key: Some(key),
                before_execution_state: Some(before),
            }
        }
    }

    /// Whether caching is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    /// The cache key, if inputs were fingerprinted.
    #[must_use]
    pub fn key(&self) -> Option<&BuildCacheKey> {
        match self {
            Self::Enabled { key, .. } => Some(key),
            Self::Disabled { key, .. } => key.as_ref(),
        }
    }

    /// Inputs, if they were fingerprinted.
    #[must_use]
    pub fn before_execution_state(&self) -> Option<&BeforeExecutionState> {
        match self {
            Self::Enabled {
                before_execution_state,
                ..
            } => Some(before_execution_state),
            Self::Disabled {
                before_execution_state,
                ..
            } => before_execution_state.as_ref(),
        }
    }

    /// Reasons caching is disabled; empty when enabled.
    #[must_use]
    pub fn disabled_reasons(&self) -> &[CachingDisabledReason] {
        match self {
            Self::Enabled { .. } => &[],
            Self::Disabled { reasons, .. } => reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn before(source: &str) -> BeforeExecutionState {
        BeforeExecutionState {
            implementation: ImplementationSnapshot::new("JavaCompile", "1"),
            additional_implementations: Vec::new(),
            input_properties: BTreeMap::from([
                ("release".to_string(), ValueSnapshot::from(17)),
                ("source".to_string(), ValueSnapshot::from(source)),
            ]),
            input_file_properties: BTreeMap::new(),
            output_file_location_snapshots: BTreeMap::from([(
                "classes".to_string(),
                FileCollectionFingerprint::empty(),
            )]),
        }
    }

    #[test]
    fn test_enabled_without_reasons() {
        let state = CachingState::from_reasons(Vec::new(), before("a"));
        assert!(state.is_enabled());
        assert_eq!(state.key(), Some(&before("a").cache_key()));
        assert!(state.disabled_reasons().is_empty());
    }

    #[test]
    fn test_disabled_keeps_key_and_inputs() {
        let reason = CachingDisabledReason::new(CachingDisabledReasonCategory::NotCacheable, "not cacheable");
        let state = CachingState::from_reasons(vec![reason.clone()], before("a"));
        assert!(!state.is_enabled());
        assert!(state.key().is_some());
        assert!(state.before_execution_state().is_some());
        assert_eq!(state.disabled_reasons(), &[reason]);
    }

    #[test]
    fn test_unknown_implementation_disables_caching() {
        let mut state = before("a");
        state.implementation = ImplementationSnapshot::unknown("closure");
        let caching = CachingState::from_reasons(Vec::new(), state);
        assert_eq!(
            caching.disabled_reasons()[0].category(),
            CachingDisabledReasonCategory::NonCacheableImplementation
        );
    }

    #[test]
    fn test_not_determined() {
        let state = CachingState::not_determined();
        assert_eq!(state.disabled_reasons()[0].message(), "Cacheability was not determined");
        assert!(state.key().is_none());
    }

    #[test]
    fn test_key_ignores_output_contents() {
        let empty = before("a");
        let mut populated = before("a");
        let _ = populated.output_file_location_snapshots.insert(
            "classes".to_string(),
            FileCollectionFingerprint::from_snapshots(
                &[std::sync::Arc::new(convenient_vfs::Snapshot::missing(
                    "/out",
                    convenient_vfs::AccessType::Direct,
                ))],
                crate::work::fingerprint::PathNormalizer::AbsolutePath,
            ),
        );
        assert_eq!(empty.cache_key(), populated.cache_key());
        assert_ne!(empty.cache_key(), before("b").cache_key());
    }
}
