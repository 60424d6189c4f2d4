//! Merge/rebase a worktree against its base branch, detecting conflicts and
//! rolling back on failure (`syncWithMain`, §4.G).

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::utils::command::run_command;

use super::GitOperations;

/// Merge strategy requested by a sync call.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// `git merge origin/<base>`.
    Merge,
    /// `git rebase origin/<base>`.
    Rebase,
}

/// Result of [`SyncManager::sync_with_main`].
#[typeshare]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Merge/rebase completed with no conflicts.
    Success {
        /// The commit the worktree was on before syncing (for caller
        /// reference, not used for rollback since no conflict occurred).
        previous_commit: String,
    },
    /// A merge/rebase conflict was detected; the repository is left in a
    /// conflicted state unless the caller calls `rollback`.
    Conflict {
        /// Paths with unresolved conflict markers.
        conflicts: Vec<String>,
        /// The commit to pass to `rollback` to restore pre-sync state.
        rollback_commit: String,
    },
    /// The worktree has uncommitted changes and `force` was not set.
    DirtyState,
    /// The merge/rebase command itself failed for a reason other than a
    /// content conflict.
    SyncFailed {
        /// Sanitized error detail.
        error: String,
    },
}

/// Drives `syncWithMain` against a worktree using an injected
/// [`GitOperations`] implementation.
pub struct SyncManager {
    git: Arc<dyn GitOperations>,
}

impl SyncManager {
    /// Creates a manager backed by `git`.
    #[must_use]
    pub fn new(git: Arc<dyn GitOperations>) -> Self {
        Self { git }
    }

    /// Records the current commit, refuses on dirty state unless `force`,
    /// then merges or rebases `worktree_path` against `origin/<base>`,
    /// detecting conflicts via `diff --name-only --diff-filter=U`.
    pub async fn sync_with_main(
        &self,
        worktree_path: &Path,
        base: &str,
        strategy: SyncStrategy,
        force: bool,
    ) -> SyncOutcome {
        let dirty = match self.git.has_uncommitted_changes(worktree_path).await {
            Ok(d) => d,
            Err(e) => return SyncOutcome::SyncFailed { error: e.to_string() },
        };
        if dirty && !force {
            return SyncOutcome::DirtyState;
        }

        let previous_commit = match self.git.current_commit(worktree_path).await {
            Ok(c) => c,
            Err(e) => return SyncOutcome::SyncFailed { error: e.to_string() },
        };

        let target = format!("origin/{base}");
        let owned_args: Vec<&str> = match strategy {
            SyncStrategy::Merge => vec!["merge", target.as_str()],
            SyncStrategy::Rebase => vec!["rebase", target.as_str()],
        };

        let result = run_command("git", &owned_args, Some(worktree_path)).await;
        let output = match result {
            Ok(o) => o,
            Err(e) => return SyncOutcome::SyncFailed { error: e.to_string() },
        };

        if output.success() {
            return SyncOutcome::Success { previous_commit };
        }

        let conflict_check = run_command(
            "git",
            &["diff", "--name-only", "--diff-filter=U"],
            Some(worktree_path),
        )
        .await;

        match conflict_check {
            Ok(o) if !o.stdout.trim().is_empty() => SyncOutcome::Conflict {
                conflicts: o.stdout.lines().map(str::to_owned).collect(),
                rollback_commit: previous_commit,
            },
            _ => SyncOutcome::SyncFailed { error: "sync_failed".to_owned() },
        }
    }

    /// Restores `worktree_path` to `sha` (`git reset --hard`), the remedy
    /// for a [`SyncOutcome::Conflict`].
    ///
    /// # Errors
    /// Returns the underlying [`super::GitError`] if the reset fails.
    pub async fn rollback(&self, worktree_path: &Path, sha: &str) -> Result<(), super::GitError> {
        self.git.rollback(worktree_path, sha).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::mock::MockGit;
    use std::path::PathBuf;

    #[tokio::test]
    async fn refuses_dirty_state_without_force() {
        let git = Arc::new(MockGit::default());
        git.dirty.store(true, std::sync::atomic::Ordering::SeqCst);
        let manager = SyncManager::new(git);
        let outcome = manager
            .sync_with_main(&PathBuf::from("/tmp/does-not-matter"), "main", SyncStrategy::Merge, false)
            .await;
        assert!(matches!(outcome, SyncOutcome::DirtyState));
    }
}
