//! Outputs shared between work items.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// An output location of one work item that another work item also writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlappingOutputs {
    /// Output property of the work being checked.
    pub property_name: String,
    /// Location written by both.
    pub overlapped_path: PathBuf,
    /// Identity of the other work item.
    pub other_owner: String,
}

impl fmt::Display for OverlappingOutputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Output property '{}' overlaps with '{}', which is also written by {}",
            self.property_name,
            self.overlapped_path.display(),
            self.other_owner
        )
    }
}

/// Whether two locations overlap: equal, or one contains the other.
#[must_use]
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Output locations recorded for each work item that has run.
#[derive(Debug, Default)]
pub struct OutputRegistry {
    produced: RwLock<BTreeMap<PathBuf, String>>,
}

impl OutputRegistry {
    /// Registry with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `locations` as produced by `owner`, replacing earlier owners.
    pub fn record<'a>(&self, owner: &str, locations: impl IntoIterator<Item = &'a Path>) {
        let mut produced = self.produced.write();
        produced.retain(|_, recorded| recorded != owner);
        for location in locations {
            let _ = produced.insert(location.to_path_buf(), owner.to_string());
        }
    }

    /// First output of `owner` that overlaps a location recorded for
    /// another owner. `outputs` are `(property, location)` pairs.
    #[must_use]
    pub fn detect<'a>(
        &self,
        owner: &str,
        outputs: impl IntoIterator<Item = (&'a str, &'a Path)>,
    ) -> Option<OverlappingOutputs> {
        let produced = self.produced.read();
        for (property, location) in outputs {
            let found = produced
                .iter()
                .find(|(path, recorded)| *recorded != owner && paths_overlap(path, location));
            if let Some((path, other)) = found {
                debug!(owner, property, path = %path.display(), other, "Overlapping outputs detected");
                return Some(OverlappingOutputs {
                    property_name: property.to_string(),
                    overlapped_path: path.clone(),
                    other_owner: other.clone(),
                });
            }
        }
        None
    }

    /// Owner recorded for exactly `location`.
    #[must_use]
    pub fn owner_of(&self, location: &Path) -> Option<String> {
        self.produced.read().get(location).cloned()
    }
}
