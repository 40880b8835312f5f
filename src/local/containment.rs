use std::path::{Component, Path, PathBuf};

/// A client path that would resolve outside the uploads root
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("path escapes the uploads root: {0}")]
pub struct PathEscape(pub String);

/// Joins a client-supplied relative path onto `root`.
///
/// The check is lexical. Absolute paths, drive prefixes and any `..`
/// component are rejected; an empty path or `.` resolves to `root` itself.
/// Symlinks already inside the root are not followed or checked.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, PathEscape> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(PathEscape(relative.to_string()));
    }

    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PathEscape(relative.to_string()));
            }
        }
    }
    Ok(resolved)
}

/// True when `relative` names the root itself.
pub fn is_root(relative: &str) -> bool {
    Path::new(relative)
        .components()
        .all(|c| matches!(c, Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joins_nested_paths() {
        let root = Path::new("/srv/uploads");
        assert_eq!(
            resolve_within(root, "photos/2024").unwrap(),
            PathBuf::from("/srv/uploads/photos/2024")
        );
        assert_eq!(resolve_within(root, "./a/./b").unwrap(), PathBuf::from("/srv/uploads/a/b"));
        assert_eq!(resolve_within(root, "").unwrap(), root);
    }

    #[test]
    fn test_rejects_escapes() {
        let root = Path::new("/srv/uploads");
        for path in ["../../etc", "..", "a/../../b", "a/..", "/etc/passwd", "/"] {
            assert_eq!(
                resolve_within(root, path),
                Err(PathEscape(path.to_string())),
                "{} should be rejected",
                path
            );
        }
    }

    #[test]
    fn test_root_detection() {
        assert!(is_root(""));
        assert!(is_root("."));
        assert!(is_root("./"));
        assert!(!is_root("a"));
    }
}
