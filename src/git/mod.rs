//! Git shell-out driver, branch sync, and commit-diff change analysis
//! (§4.G).

pub mod changes;
pub mod sync;

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::utils::command::run_command;

pub use changes::{ALL_SERVICES, ChangeAnalysis, ChangeDetector};
pub use sync::{SyncManager, SyncOutcome, SyncStrategy};

/// Errors from git shell-outs.
#[derive(Debug, Error)]
pub enum GitError {
    /// `git` exited non-zero; stderr preserved verbatim.
    #[error("git {command} failed: {stderr}")]
    CommandFailed {
        /// The git subcommand invoked.
        command: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Underlying process/IO error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One entry of `fetchUpstream`'s recent-commit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    /// Abbreviated commit SHA.
    pub sha: String,
    /// First line of the commit message.
    pub message: String,
}

/// Result of [`GitOperations::fetch_upstream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResult {
    /// Whether `origin/<base>` has commits not yet merged locally.
    pub has_updates: bool,
    /// `rev-list --count HEAD..origin/<base>`.
    pub commit_count: u32,
    /// Up to the last 10 commits on `origin/<base>` not yet merged.
    pub commits: Vec<CommitSummary>,
}

/// Abstraction over the git CLI, so `WorktreeLifecycle` and `SyncManager`
/// are testable against a mock implementation without a real repository
/// (Design Notes §9, §10.4).
#[async_trait]
pub trait GitOperations: Send + Sync {
    /// Creates (or checks out, if the branch already exists) a worktree for
    /// `branch` at `path`, branching from `from_branch` when new. Returns
    /// `Some(warning)` if the worktree was created but a post-checkout hook
    /// failed non-fatally.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if `git worktree add` fails for a
    /// reason other than the benign post-checkout-hook case.
    async fn add_worktree(&self, path: &Path, branch: &str, from_branch: &str, force: bool) -> Result<Option<String>, GitError>;

    /// Removes the worktree at `path`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] if `git worktree remove` fails
    /// and the fallback directory removal also fails.
    async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError>;

    /// `git worktree prune`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn prune_worktrees(&self) -> Result<(), GitError>;

    /// `git worktree repair`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn repair_worktrees(&self) -> Result<(), GitError>;

    /// Lists `(branch, path)` pairs from `git worktree list --porcelain`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn list_worktrees(&self) -> Result<Vec<(String, std::path::PathBuf)>, GitError>;

    /// True if `branch` exists locally.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on an unexpected git failure.
    async fn branch_exists(&self, branch: &str) -> Result<bool, GitError>;

    /// `git push -u origin <branch>` with a timeout; failures are non-fatal
    /// at the call site.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure or timeout.
    async fn push_upstream(&self, worktree_path: &Path, branch: &str) -> Result<(), GitError>;

    /// `git fetch origin` then counts/lists commits ahead on `origin/<base>`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn fetch_upstream(&self, worktree_path: &Path, base: &str) -> Result<FetchResult, GitError>;

    /// Porcelain status length > 0.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn has_uncommitted_changes(&self, worktree_path: &Path) -> Result<bool, GitError>;

    /// Current `HEAD` commit SHA.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn current_commit(&self, worktree_path: &Path) -> Result<String, GitError>;

    /// `git reset --hard <sha>`.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn rollback(&self, worktree_path: &Path, sha: &str) -> Result<(), GitError>;

    /// Commits in `HEAD` not yet on `origin/<base>` (`rev-list --count
    /// origin/<base>..HEAD`), for the `ahead` field of a worktree snapshot
    /// (§3).
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn ahead_count(&self, worktree_path: &Path, base: &str) -> Result<u32, GitError>;

    /// The most recent commit at `HEAD`, or `None` for a repository with no
    /// commits yet.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn last_commit(&self, worktree_path: &Path) -> Result<Option<LastCommitInfo>, GitError>;

    /// The `origin` remote URL, or `None` if no such remote is configured.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on an unexpected git failure.
    async fn remote_url(&self, worktree_path: &Path) -> Result<Option<String>, GitError>;

    /// Counts of modified-tracked and untracked files from porcelain status.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn status_counts(&self, worktree_path: &Path) -> Result<StatusCounts, GitError>;

    /// Commits on `origin/<base>` not yet merged into `HEAD`
    /// (`rev-list --count HEAD..origin/<base>`), for the `behind` field of a
    /// worktree snapshot (§3). Mirrors [`Self::ahead_count`] in the opposite
    /// direction; does not itself fetch.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn behind_count(&self, worktree_path: &Path, base: &str) -> Result<u32, GitError>;

    /// Paths with unresolved merge conflicts (`diff --name-only
    /// --diff-filter=U`), for the `/conflicts` endpoint and sync outcomes.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on failure.
    async fn conflicted_paths(&self, worktree_path: &Path) -> Result<Vec<String>, GitError>;

    /// Whether `HEAD` is already an ancestor of `origin/<base>` (`merge-base
    /// --is-ancestor`), i.e. this worktree's branch has nothing left to land.
    ///
    /// # Errors
    /// Returns [`GitError::CommandFailed`] on an unexpected git failure (a
    /// non-ancestor relationship is a successful `Ok(false)`, not an error).
    async fn is_merged_into(&self, worktree_path: &Path, base: &str) -> Result<bool, GitError>;
}

/// Result of [`GitOperations::last_commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastCommitInfo {
    /// Full commit SHA.
    pub sha: String,
    /// First line of the commit message.
    pub message: String,
    /// RFC3339 author timestamp, as produced by `%aI`.
    pub authored_at: String,
}

/// Result of [`GitOperations::status_counts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Count of tracked files with local modifications.
    pub modified: u32,
    /// Count of untracked files.
    pub untracked: u32,
}

/// Real `git` CLI-backed implementation of [`GitOperations`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GitDriver;

#[async_trait]
impl GitOperations for GitDriver {
    async fn add_worktree(&self, path: &Path, branch: &str, from_branch: &str, force: bool) -> Result<Option<String>, GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let exists = self.branch_exists(branch).await?;

        let mut args: Vec<&str> = vec!["worktree", "add"];
        if force {
            args.push("--force");
        }
        if exists {
            args.push(&path_str);
            args.push(branch);
        } else {
            args.push("-b");
            args.push(branch);
            args.push(&path_str);
            args.push(from_branch);
        }

        let output = run_command("git", &args, None).await?;
        if output.success() {
            return Ok(None);
        }

        // The worktree directory can exist with a functioning checkout even
        // when a post-checkout hook failed; that is a non-fatal warning, not
        // a pipeline failure.
        if path.join(".git").exists() && output.stderr.contains("hook") {
            return Ok(Some(output.stderr));
        }

        if output.stderr.contains("already registered") && !force {
            return self.add_worktree(path, branch, from_branch, true).await;
        }

        Err(GitError::CommandFailed { command: "worktree add".into(), stderr: output.stderr })
    }

    async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);

        let output = run_command("git", &args, None).await?;
        if output.success() {
            return Ok(());
        }

        if path.exists() {
            tokio::fs::remove_dir_all(path).await.map_err(|e| GitError::Other(e.into()))?;
        }
        self.prune_worktrees().await
    }

    async fn prune_worktrees(&self) -> Result<(), GitError> {
        let output = run_command("git", &["worktree", "prune"], None).await?;
        if output.success() {
            Ok(())
        } else {
            Err(GitError::CommandFailed { command: "worktree prune".into(), stderr: output.stderr })
        }
    }

    async fn repair_worktrees(&self) -> Result<(), GitError> {
        // Non-fatal by contract (W-Create step 2): swallow failures here,
        // the caller only logs a warning.
        let _ = run_command("git", &["worktree", "repair"], None).await;
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<(String, std::path::PathBuf)>, GitError> {
        let output = run_command("git", &["worktree", "list", "--porcelain"], None).await?;
        if !output.success() {
            return Err(GitError::CommandFailed { command: "worktree list".into(), stderr: output.stderr });
        }

        let mut out = Vec::new();
        let mut current_path: Option<std::path::PathBuf> = None;
        for line in output.stdout.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                current_path = Some(std::path::PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
                if let Some(path) = current_path.take() {
                    out.push((b.to_owned(), path));
                }
            }
        }
        Ok(out)
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let ref_arg = format!("refs/heads/{branch}");
        let output = run_command("git", &["show-ref", "--verify", "--quiet", &ref_arg], None).await?;
        Ok(output.success())
    }

    async fn push_upstream(&self, worktree_path: &Path, branch: &str) -> Result<(), GitError> {
        use crate::utils::command::{RunOptions, run_command_with};
        let output = run_command_with(
            "git",
            &["push", "-u", "origin", branch],
            RunOptions {
                cwd: Some(worktree_path),
                timeout: Some(std::time::Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .await?;
        if output.success() {
            Ok(())
        } else {
            Err(GitError::CommandFailed { command: "push".into(), stderr: output.stderr })
        }
    }

    async fn fetch_upstream(&self, worktree_path: &Path, base: &str) -> Result<FetchResult, GitError> {
        let fetch = run_command("git", &["fetch", "origin"], Some(worktree_path)).await?;
        if !fetch.success() {
            return Err(GitError::CommandFailed { command: "fetch".into(), stderr: fetch.stderr });
        }

        let range = format!("HEAD..origin/{base}");
        let count_out = run_command("git", &["rev-list", "--count", &range], Some(worktree_path)).await?;
        let commit_count: u32 = count_out.stdout.trim().parse().unwrap_or(0);

        let log_out = run_command("git", &["log", "--oneline", "-n", "10", &range], Some(worktree_path)).await?;
        let commits = log_out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, ' ');
                let sha = parts.next()?.to_owned();
                let message = parts.next().unwrap_or_default().to_owned();
                Some(CommitSummary { sha, message })
            })
            .collect();

        Ok(FetchResult { has_updates: commit_count > 0, commit_count, commits })
    }

    async fn has_uncommitted_changes(&self, worktree_path: &Path) -> Result<bool, GitError> {
        let output = run_command("git", &["status", "--porcelain"], Some(worktree_path)).await?;
        if !output.success() {
            return Err(GitError::CommandFailed { command: "status".into(), stderr: output.stderr });
        }
        Ok(!output.stdout.trim().is_empty())
    }

    async fn current_commit(&self, worktree_path: &Path) -> Result<String, GitError> {
        let output = run_command("git", &["rev-parse", "HEAD"], Some(worktree_path)).await?;
        if !output.success() {
            return Err(GitError::CommandFailed { command: "rev-parse".into(), stderr: output.stderr });
        }
        Ok(output.stdout.trim().to_owned())
    }

    async fn rollback(&self, worktree_path: &Path, sha: &str) -> Result<(), GitError> {
        let output = run_command("git", &["reset", "--hard", sha], Some(worktree_path)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(GitError::CommandFailed { command: "reset --hard".into(), stderr: output.stderr })
        }
    }

    async fn ahead_count(&self, worktree_path: &Path, base: &str) -> Result<u32, GitError> {
        let range = format!("origin/{base}..HEAD");
        let output = run_command("git", &["rev-list", "--count", &range], Some(worktree_path)).await?;
        if !output.success() {
            return Err(GitError::CommandFailed { command: "rev-list".into(), stderr: output.stderr });
        }
        Ok(output.stdout.trim().parse().unwrap_or(0))
    }

    async fn last_commit(&self, worktree_path: &Path) -> Result<Option<LastCommitInfo>, GitError> {
        let output = run_command("git", &["log", "-1", "--format=%H\x1f%s\x1f%aI"], Some(worktree_path)).await?;
        if !output.success() {
            // An empty repository (no commits yet) is not an error condition.
            return Ok(None);
        }
        let line = output.stdout.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let mut parts = line.splitn(3, '\u{1f}');
        let sha = parts.next().unwrap_or_default().to_owned();
        let message = parts.next().unwrap_or_default().to_owned();
        let authored_at = parts.next().unwrap_or_default().to_owned();
        Ok(Some(LastCommitInfo { sha, message, authored_at }))
    }

    async fn remote_url(&self, worktree_path: &Path) -> Result<Option<String>, GitError> {
        let output = run_command("git", &["config", "--get", "remote.origin.url"], Some(worktree_path)).await?;
        if !output.success() {
            return Ok(None);
        }
        let url = output.stdout.trim();
        Ok(if url.is_empty() { None } else { Some(url.to_owned()) })
    }

    async fn status_counts(&self, worktree_path: &Path) -> Result<StatusCounts, GitError> {
        let output = run_command("git", &["status", "--porcelain"], Some(worktree_path)).await?;
        if !output.success() {
            return Err(GitError::CommandFailed { command: "status".into(), stderr: output.stderr });
        }
        let mut counts = StatusCounts::default();
        for line in output.stdout.lines() {
            if line.starts_with("??") {
                counts.untracked += 1;
            } else if !line.trim().is_empty() {
                counts.modified += 1;
            }
        }
        Ok(counts)
    }

    async fn behind_count(&self, worktree_path: &Path, base: &str) -> Result<u32, GitError> {
        let range = format!("HEAD..origin/{base}");
        let output = run_command("git", &["rev-list", "--count", &range], Some(worktree_path)).await?;
        if !output.success() {
            return Err(GitError::CommandFailed { command: "rev-list".into(), stderr: output.stderr });
        }
        Ok(output.stdout.trim().parse().unwrap_or(0))
    }

    async fn conflicted_paths(&self, worktree_path: &Path) -> Result<Vec<String>, GitError> {
        let output = run_command("git", &["diff", "--name-only", "--diff-filter=U"], Some(worktree_path)).await?;
        if !output.success() {
            return Err(GitError::CommandFailed { command: "diff".into(), stderr: output.stderr });
        }
        Ok(output.stdout.lines().map(str::to_owned).collect())
    }

    async fn is_merged_into(&self, worktree_path: &Path, base: &str) -> Result<bool, GitError> {
        let upstream = format!("origin/{base}");
        let output = run_command("git", &["merge-base", "--is-ancestor", "HEAD", &upstream], Some(worktree_path)).await?;
        // Exit code 1 means "not an ancestor", which is a well-formed `false`,
        // not a failure; only other non-zero codes indicate a real error.
        if output.success() {
            Ok(true)
        } else if output.exit_code == 1 {
            Ok(false)
        } else {
            Err(GitError::CommandFailed { command: "merge-base".into(), stderr: output.stderr })
        }
    }
}

/// In-memory mock of [`GitOperations`] for pipeline tests (§10.4).
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::{CommitSummary, FetchResult, GitError, GitOperations, LastCommitInfo, StatusCounts};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Scripted, in-memory [`GitOperations`] for deterministic pipeline
    /// tests without a real repository.
    #[derive(Default)]
    pub struct MockGit {
        /// Branches considered to already exist.
        pub existing_branches: Mutex<Vec<String>>,
        /// Worktrees registered so far: branch -> path.
        pub worktrees: Mutex<HashMap<String, PathBuf>>,
        /// When true, `has_uncommitted_changes` reports dirty state.
        pub dirty: std::sync::atomic::AtomicBool,
        /// Scripted fetch result.
        pub fetch_result: Mutex<Option<FetchResult>>,
        /// Scripted ahead count.
        pub ahead: std::sync::atomic::AtomicU32,
        /// Scripted last commit.
        pub last_commit: Mutex<Option<LastCommitInfo>>,
        /// Scripted remote URL.
        pub remote_url: Mutex<Option<String>>,
        /// Scripted status counts.
        pub status_counts: Mutex<StatusCounts>,
        /// Scripted behind count.
        pub behind: std::sync::atomic::AtomicU32,
        /// Scripted conflicted paths.
        pub conflicted_paths: Mutex<Vec<String>>,
        /// Scripted merged-into-base answer.
        pub merged: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl GitOperations for MockGit {
        async fn add_worktree(&self, path: &Path, branch: &str, _from_branch: &str, _force: bool) -> Result<Option<String>, GitError> {
            self.worktrees.lock().unwrap().insert(branch.to_owned(), path.to_owned());
            self.existing_branches.lock().unwrap().push(branch.to_owned());
            Ok(None)
        }

        async fn remove_worktree(&self, path: &Path, _force: bool) -> Result<(), GitError> {
            self.worktrees.lock().unwrap().retain(|_, p| p != path);
            Ok(())
        }

        async fn prune_worktrees(&self) -> Result<(), GitError> {
            Ok(())
        }

        async fn repair_worktrees(&self) -> Result<(), GitError> {
            Ok(())
        }

        async fn list_worktrees(&self) -> Result<Vec<(String, PathBuf)>, GitError> {
            Ok(self.worktrees.lock().unwrap().iter().map(|(b, p)| (b.clone(), p.clone())).collect())
        }

        async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
            Ok(self.existing_branches.lock().unwrap().iter().any(|b| b == branch))
        }

        async fn push_upstream(&self, _worktree_path: &Path, _branch: &str) -> Result<(), GitError> {
            Ok(())
        }

        async fn fetch_upstream(&self, _worktree_path: &Path, _base: &str) -> Result<FetchResult, GitError> {
            Ok(self.fetch_result.lock().unwrap().clone().unwrap_or(FetchResult {
                has_updates: false,
                commit_count: 0,
                commits: Vec::new(),
            }))
        }

        async fn has_uncommitted_changes(&self, _worktree_path: &Path) -> Result<bool, GitError> {
            Ok(self.dirty.load(std::sync::atomic::Ordering::SeqCst))
        }

        async fn current_commit(&self, _worktree_path: &Path) -> Result<String, GitError> {
            Ok("deadbeef".to_owned())
        }

        async fn rollback(&self, _worktree_path: &Path, _sha: &str) -> Result<(), GitError> {
            Ok(())
        }

        async fn ahead_count(&self, _worktree_path: &Path, _base: &str) -> Result<u32, GitError> {
            Ok(self.ahead.load(std::sync::atomic::Ordering::SeqCst))
        }

        async fn last_commit(&self, _worktree_path: &Path) -> Result<Option<LastCommitInfo>, GitError> {
            Ok(self.last_commit.lock().unwrap().clone())
        }

        async fn remote_url(&self, _worktree_path: &Path) -> Result<Option<String>, GitError> {
            Ok(self.remote_url.lock().unwrap().clone())
        }

        async fn status_counts(&self, _worktree_path: &Path) -> Result<StatusCounts, GitError> {
            Ok(*self.status_counts.lock().unwrap())
        }

        async fn behind_count(&self, _worktree_path: &Path, _base: &str) -> Result<u32, GitError> {
            Ok(self.behind.load(std::sync::atomic::Ordering::SeqCst))
        }

        async fn conflicted_paths(&self, _worktree_path: &Path) -> Result<Vec<String>, GitError> {
            Ok(self.conflicted_paths.lock().unwrap().clone())
        }

        async fn is_merged_into(&self, _worktree_path: &Path, _base: &str) -> Result<bool, GitError> {
            Ok(self.merged.load(std::sync::atomic::Ordering::SeqCst))
        }
    }

    #[allow(unused_imports)]
    use CommitSummary as _CommitSummaryReexport;
}
