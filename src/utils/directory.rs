use std::fs;
use std::path::{Path, PathBuf};

/// Read directories from a path, returning only directories (no files).
///
/// # Errors
/// Returns an error if the directory cannot be read or permission is denied.
pub fn read_directories(path: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut dirs = Vec::new();

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }

    dirs.sort_by(|a, b| {
        let a_name = a
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_lowercase();
        let b_name = b
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_lowercase();
        a_name.cmp(&b_name)
    });

    Ok(dirs)
}

/// Expand a leading `~` in `path` to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            if path.len() > 1 && path.starts_with("~/") {
                return home.join(&path[2..]);
            }
            return home;
        }
    }
    PathBuf::from(path)
}

/// Canonicalize a path, resolving `.`/`..` and symlinks.
///
/// # Errors
/// Returns an error if the path cannot be canonicalized (e.g. it does not
/// exist).
pub fn normalize_path(path: &Path) -> Result<PathBuf, std::io::Error> {
    path.canonicalize()
}

/// Resolves `candidate` (possibly relative) against `base`, then checks the
/// resolved path is still contained within `base`. This is the path
/// validator's boundary check: `"../etc/passwd"` is rejected, `"./a/../b"`
/// resolves inside `base` and is accepted.
///
/// `base` itself need not exist on disk for this check; only lexical
/// containment is verified, since the target path (e.g. a not-yet-created
/// worktree directory) may not exist yet.
#[must_use]
pub fn resolve_within(base: &Path, candidate: &Path) -> Option<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };

    let resolved = lexical_normalize(&joined);
    let base_resolved = lexical_normalize(base);

    if resolved.starts_with(&base_resolved) {
        Some(resolved)
    } else {
        None
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_read_directories_only_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let temp_path = temp_dir.path();

        fs::create_dir_all(temp_path.join("dir1")).unwrap();
        fs::create_dir_all(temp_path.join("dir2")).unwrap();
        fs::create_dir_all(temp_path.join("aaa_first")).unwrap();
        File::create(temp_path.join("file.txt")).unwrap();

        let dirs = read_directories(temp_path).unwrap();
        assert_eq!(dirs.len(), 3);

        let names: Vec<String> = dirs
            .iter()
            .map(|d| d.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["aaa_first", "dir1", "dir2"]);
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/test");
        assert!(!expanded.to_string_lossy().contains('~'));
        assert!(expanded.to_string_lossy().ends_with("test"));

        let expanded = expand_tilde("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_resolve_within_rejects_traversal() {
        let base = Path::new("/project/.worktrees");
        assert!(resolve_within(base, Path::new("../etc/passwd")).is_none());
    }

    #[test]
    fn test_resolve_within_accepts_internal_dotdot() {
        let base = Path::new("/project/.worktrees");
        let resolved = resolve_within(base, Path::new("./a/../b")).unwrap();
        assert_eq!(resolved, PathBuf::from("/project/.worktrees/b"));
    }

    #[test]
    fn test_resolve_within_rejects_absolute_escape() {
        let base = Path::new("/project/.worktrees");
        assert!(resolve_within(base, Path::new("/etc/passwd")).is_none());
    }
}
