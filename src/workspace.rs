//! Workspace path resolution and storage keys.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

/// Resolve a workspace path to an absolute, lexically normalized form.
///
/// Relative paths are joined onto the current directory. `.` and `..`
/// components and trailing separators are removed without touching the
/// filesystem, so workspaces that do not exist yet resolve the same way
/// every time.
pub fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    normalize(&absolute)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::RootDir.as_os_str());
    }
    out
}

/// Deterministic storage key for a workspace (24 hex chars).
pub fn hash(path: &Path) -> String {
    let resolved = resolve(path);
    let mut hasher = Sha256::new();
    hasher.update(resolved.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..12])
}

/// True when `child` equals `root` or sits underneath it.
pub fn is_within(child: &Path, root: &Path) -> bool {
    resolve(child).starts_with(resolve(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_and_dots_normalize_to_same_key() {
        let a = hash(Path::new("/home/u/ws"));
        let b = hash(Path::new("/home/u/ws/"));
        let c = hash(Path::new("/home/u/./other/../ws"));
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 24);
    }

    #[test]
    fn different_paths_get_different_keys() {
        assert_ne!(hash(Path::new("/home/u/ws")), hash(Path::new("/home/u/ws2")));
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(resolve(Path::new("sub")), cwd.join("sub"));
    }

    #[test]
    fn within_is_component_wise() {
        assert!(is_within(Path::new("/home/u/ws"), Path::new("/home/u/ws")));
        assert!(is_within(Path::new("/home/u/ws/sub"), Path::new("/home/u/ws/")));
        assert!(!is_within(Path::new("/home/u/ws2"), Path::new("/home/u/ws")));
        assert!(!is_within(Path::new("/home/u/ws/../x"), Path::new("/home/u/ws")));
    }
}
