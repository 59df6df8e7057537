//! Directories allocated to units of work.

use crate::error::Result;
use crate::work::Identity;
use std::fs;
use std::path::{Path, PathBuf};

/// Hands out the workspace a unit of work executes in.
pub trait WorkspaceProvider: Send + Sync {
    /// Workspace for the work identified by `identity`, created if needed.
    ///
    /// # Errors
    ///
    /// Creating the directory failed.
    fn workspace_for(&self, identity: &Identity) -> Result<PathBuf>;
}

/// Every work item shares one directory.
#[derive(Debug, Clone)]
pub struct FixedWorkspaceProvider {
    root: PathBuf,
}

impl FixedWorkspaceProvider {
    /// Provider handing out `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl WorkspaceProvider for FixedWorkspaceProvider {
    fn workspace_for(&self, _identity: &Identity) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        Ok(self.root.clone())
    }
}

/// One directory per identity, sharded like the content store:
/// `<root>/<first two hex chars>/<id>`.
#[derive(Debug, Clone)]
pub struct HashedWorkspaceProvider {
    root: PathBuf,
}

impl HashedWorkspaceProvider {
    /// Provider allocating below `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root all workspaces live under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl WorkspaceProvider for HashedWorkspaceProvider {
    fn workspace_for(&self, identity: &Identity) -> Result<PathBuf> {
        let id: String = identity
            .unique_id()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let shard = id.get(..2).unwrap_or("00");
        let path = self.root.join(shard).join(&id);
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hashed_workspaces_are_stable_and_distinct() {
        let temp = TempDir::new().unwrap();
        let provider = HashedWorkspaceProvider::new(temp.path());
        let a = provider.workspace_for(&Identity::new("abcdef")).unwrap();
        let again = provider.workspace_for(&Identity::new("abcdef")).unwrap();
        let b = provider.workspace_for(&Identity::new("123456")).unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(a, temp.path().join("ab").join("abcdef"));
        assert!(a.is_dir());
    }

    #[test]
    fn test_identity_is_sanitized() {
        let temp = TempDir::new().unwrap();
        let provider = HashedWorkspaceProvider::new(temp.path());
        let path = provider.workspace_for(&Identity::new(":app:compile")).unwrap();
        assert!(path.starts_with(temp.path()));
        assert_eq!(path.file_name().unwrap(), "_app_compile");
    }

    #[test]
    fn test_fixed_workspace() {
        let temp = TempDir::new().unwrap();
        let provider = FixedWorkspaceProvider::new(temp.path().join("ws"));
        assert_eq!(
            provider.workspace_for(&Identity::new("x")).unwrap(),
            temp.path().join("ws")
        );
    }
}
