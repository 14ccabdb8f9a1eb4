//! Access policy guard for autonomous actions.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::workspace;

/// How far autonomous work may reach outside the workspace root.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AccessScope {
    #[default]
    Workspace,
    WorkspacePlus,
    Full,
}

impl std::fmt::Display for AccessScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessScope::Workspace => write!(f, "workspace"),
            AccessScope::WorkspacePlus => write!(f, "workspace-plus"),
            AccessScope::Full => write!(f, "full"),
        }
    }
}

impl FromStr for AccessScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "workspace" => Ok(AccessScope::Workspace),
            "workspace-plus" | "workspace_plus" => Ok(AccessScope::WorkspacePlus),
            "full" => Ok(AccessScope::Full),
            _ => Err(format!("Unknown access scope: {}", s)),
        }
    }
}

/// Access policy configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AccessPolicy {
    #[serde(default)]
    pub scope: AccessScope,

    /// Extra roots, only honoured under `workspace-plus`.
    #[serde(default)]
    pub allow_paths: Vec<PathBuf>,
}

impl AccessPolicy {
    pub fn new(scope: AccessScope) -> Self {
        Self {
            scope,
            allow_paths: Vec::new(),
        }
    }

    pub fn with_allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allow_paths.push(path.into());
        self
    }
}

/// Fail with [`Error::AccessDenied`] unless `target` is inside the permitted boundary.
pub fn assert_allowed(target: &Path, policy: &AccessPolicy, workspace_root: &Path) -> Result<(), Error> {
    let target = workspace::resolve(target);
    let root = workspace::resolve(workspace_root);

    if policy.scope == AccessScope::Full {
        return Ok(());
    }

    if workspace::is_within(&target, &root) {
        return Ok(());
    }

    if policy.scope == AccessScope::WorkspacePlus
        && policy
            .allow_paths
            .iter()
            .any(|allowed| workspace::is_within(&target, allowed))
    {
        return Ok(());
    }

    tracing::warn!(
        "Access denied for {} (scope={}, root={})",
        target.display(),
        policy.scope,
        root.display()
    );
    Err(Error::AccessDenied {
        path: target,
        scope: policy.scope,
        root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/home/u/ws";

    #[test]
    fn workspace_scope_rejects_outside_paths() {
        let policy = AccessPolicy::new(AccessScope::Workspace);
        let err = assert_allowed(Path::new("/etc/passwd"), &policy, Path::new(ROOT)).unwrap_err();
        match err {
            Error::AccessDenied { path, scope, root } => {
                assert_eq!(path, PathBuf::from("/etc/passwd"));
                assert_eq!(scope, AccessScope::Workspace);
                assert_eq!(root, PathBuf::from(ROOT));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn workspace_scope_allows_root_and_descendants() {
        let policy = AccessPolicy::new(AccessScope::Workspace);
        assert!(assert_allowed(Path::new("/home/u/ws/sub"), &policy, Path::new(ROOT)).is_ok());
        assert!(assert_allowed(Path::new("/home/u/ws/"), &policy, Path::new(ROOT)).is_ok());
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_a_descendant() {
        let policy = AccessPolicy::new(AccessScope::Workspace);
        assert!(assert_allowed(Path::new("/home/u/ws-evil"), &policy, Path::new(ROOT)).is_err());
    }

    #[test]
    fn workspace_plus_honours_allow_paths() {
        let policy = AccessPolicy::new(AccessScope::WorkspacePlus).with_allow_path("/other");
        assert!(assert_allowed(Path::new("/other"), &policy, Path::new(ROOT)).is_ok());
        assert!(assert_allowed(Path::new("/other/deep/dir"), &policy, Path::new(ROOT)).is_ok());
        assert!(assert_allowed(Path::new("/elsewhere"), &policy, Path::new(ROOT)).is_err());
    }

    #[test]
    fn allow_paths_ignored_under_plain_workspace_scope() {
        let policy = AccessPolicy::new(AccessScope::Workspace).with_allow_path("/other");
        assert!(assert_allowed(Path::new("/other"), &policy, Path::new(ROOT)).is_err());
    }

    #[test]
    fn full_scope_allows_everything() {
        let policy = AccessPolicy::new(AccessScope::Full);
        assert!(assert_allowed(Path::new("/etc/passwd"), &policy, Path::new(ROOT)).is_ok());
    }

    #[test]
    fn scope_parses_from_config_strings() {
        assert_eq!("workspace-plus".parse::<AccessScope>(), Ok(AccessScope::WorkspacePlus));
        assert_eq!("FULL".parse::<AccessScope>(), Ok(AccessScope::Full));
        assert!("anywhere".parse::<AccessScope>().is_err());
        let json = serde_json::to_string(&AccessScope::WorkspacePlus).unwrap();
        assert_eq!(json, "\"workspace-plus\"");
    }
}
