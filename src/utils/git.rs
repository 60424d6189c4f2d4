use anyhow::Context;
use std::path::{Path, PathBuf};

/// Result of git root detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRootInfo {
    /// Absolute path to the git repository root (where `.git` exists).
    pub git_root: PathBuf,
    /// Relative path from the git root to the original subdirectory; empty
    /// if the input was the root itself.
    pub subdirectory: PathBuf,
}

/// Finds the git repository root from any path within the repo, walking
/// upward until a `.git` directory or file is found. Handles both regular
/// repositories (`.git` is a directory) and worktrees (`.git` is a file
/// containing a `gitdir:` reference).
///
/// # Errors
/// Returns an error if the path does not exist, is not within a git
/// repository, or a worktree's `.git` file is malformed.
pub fn find_git_root(path: &Path) -> anyhow::Result<GitRootInfo> {
    let canonical_path = path.canonicalize().with_context(|| {
        format!(
            "path does not exist or is not accessible: {}",
            path.display()
        )
    })?;

    if !canonical_path.is_dir() {
        anyhow::bail!("path is not a directory: {}", canonical_path.display());
    }

    let mut current = canonical_path.as_path();

    loop {
        let git_path = current.join(".git");

        if git_path.exists() {
            let git_root = if git_path.is_dir() {
                current.to_path_buf()
            } else if git_path.is_file() {
                let parent_git = parse_worktree_git_file(&git_path, current)?;
                parent_git
                    .parent()
                    .ok_or_else(|| {
                        anyhow::anyhow!("invalid git directory: no parent for {}", parent_git.display())
                    })?
                    .to_path_buf()
            } else {
                anyhow::bail!(
                    "invalid .git entry at {}: not a regular file or directory",
                    git_path.display()
                );
            };

            let subdirectory = canonical_path
                .strip_prefix(&git_root)
                .map(std::path::Path::to_path_buf)
                .unwrap_or_default();

            return Ok(GitRootInfo {
                git_root,
                subdirectory,
            });
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => anyhow::bail!(
                "path is not within a git repository: {}",
                canonical_path.display()
            ),
        }
    }
}

/// Detects whether `path` is a git worktree (its `.git` entry is a file) and,
/// if so, returns the parent repository's `.git` directory.
///
/// # Errors
/// Returns an error if the `.git` file exists but cannot be read or parsed.
pub fn detect_worktree_parent_git_dir(path: &Path) -> anyhow::Result<Option<PathBuf>> {
    let git_file = path.join(".git");
    if !git_file.exists() || !git_file.is_file() {
        return Ok(None);
    }
    Ok(Some(parse_worktree_git_file(&git_file, path)?))
}

fn parse_worktree_git_file(git_file: &Path, worktree_path: &Path) -> anyhow::Result<PathBuf> {
    let contents = std::fs::read_to_string(git_file)
        .with_context(|| format!("failed to read .git file: {}", git_file.display()))?;

    let gitdir_line = contents
        .lines()
        .find(|line| line.starts_with("gitdir: "))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "invalid .git file format: missing 'gitdir:' line in {}",
                git_file.display()
            )
        })?;

    let gitdir = gitdir_line.strip_prefix("gitdir: ").unwrap().trim();

    let gitdir_path = if Path::new(gitdir).is_absolute() {
        PathBuf::from(gitdir)
    } else {
        worktree_path.join(gitdir)
    };

    let canonical_gitdir = gitdir_path.canonicalize().with_context(|| {
        format!(
            "failed to resolve gitdir path {} from worktree {}",
            gitdir_path.display(),
            worktree_path.display()
        )
    })?;

    let worktrees_dir = canonical_gitdir
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid worktree gitdir: no parent for {}", canonical_gitdir.display()))?;
    let git_dir = worktrees_dir.parent().ok_or_else(|| {
        anyhow::anyhow!(
            "invalid worktree structure: expected .git/worktrees/<name>, got {}",
            canonical_gitdir.display()
        )
    })?;
    let repo_root = git_dir
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid git directory structure: no parent for {}", git_dir.display()))?;

    if !git_dir.exists() {
        anyhow::bail!(
            "parent .git directory does not exist: {}. the worktree may be corrupted or the parent repository may have been moved",
            git_dir.display()
        );
    }
    if !git_dir.join("HEAD").exists() {
        anyhow::bail!(
            "parent directory exists but is not a valid git repository: {}",
            git_dir.display()
        );
    }

    Ok(repo_root.to_path_buf())
}

/// Convenience wrapper around [`find_git_root`] that discards the result.
///
/// # Errors
/// Returns an error if the path is not within a git repository.
pub fn validate_git_repository(path: &Path) -> anyhow::Result<()> {
    find_git_root(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_repo() -> anyhow::Result<TempDir> {
        let temp_dir = TempDir::new()?;
        let git_dir = temp_dir.path().join(".git");
        fs::create_dir(&git_dir)?;
        fs::write(git_dir.join("HEAD"), "ref: refs/heads/main")?;
        Ok(temp_dir)
    }

    #[test]
    fn test_find_git_root_at_repo_root() -> anyhow::Result<()> {
        let repo = create_test_repo()?;
        let info = find_git_root(repo.path())?;
        assert_eq!(info.git_root, repo.path().canonicalize()?);
        assert_eq!(info.subdirectory, PathBuf::new());
        Ok(())
    }

    #[test]
    fn test_find_git_root_in_subdirectory() -> anyhow::Result<()> {
        let repo = create_test_repo()?;
        let subdir = repo.path().join("packages").join("foo");
        fs::create_dir_all(&subdir)?;
        let info = find_git_root(&subdir)?;
        assert_eq!(info.subdirectory, PathBuf::from("packages/foo"));
        Ok(())
    }

    #[test]
    fn test_find_git_root_non_git_directory() {
        let temp_dir = TempDir::new().unwrap();
        let result = find_git_root(temp_dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_git_repository_success() -> anyhow::Result<()> {
        let repo = create_test_repo()?;
        let subdir = repo.path().join("src");
        fs::create_dir(&subdir)?;
        assert!(validate_git_repository(&subdir).is_ok());
        Ok(())
    }
}
