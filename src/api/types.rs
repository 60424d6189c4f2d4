//! Wire DTOs for the Control API (§6), typeshared for a future TypeScript
//! client alongside the core domain types in [`crate::worktree`].

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::git::sync::SyncStrategy;

/// Body of `POST /api/worktrees`.
#[typeshare]
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorktreeRequest {
    /// Branch to check out (slugified into the worktree name).
    pub branch_name: String,
    /// Branch to create `branch_name` from, when it doesn't already exist.
    pub from_branch: String,
    /// Skip the staleness preflight and force `git worktree add --force`.
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /api/worktrees/:name/sync`.
#[typeshare]
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    /// Merge or rebase.
    pub strategy: SyncStrategy,
    /// Proceed even with uncommitted changes.
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /api/worktrees/:name/rollback`.
#[typeshare]
#[derive(Debug, Clone, Deserialize)]
pub struct RollbackRequest {
    /// Commit to reset to, normally the `rollback_commit` from a prior
    /// [`crate::git::sync::SyncOutcome::Conflict`].
    pub sha: String,
}

/// Response of `POST /api/worktrees`, mirroring [`crate::lifecycle::CreateOutcome`]
/// but flattened for the wire.
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct CreateWorktreeResponse {
    /// Whether the idempotency probe found the worktree already materialized.
    pub existed: bool,
    /// The resulting worktree, when successful.
    pub worktree: Option<crate::worktree::Worktree>,
}

/// Response of `POST /api/worktrees/:name/start`: the confirmed port map.
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct StartServicesResponse {
    /// Service key -> published host port.
    pub ports: std::collections::BTreeMap<String, u16>,
}

/// One candidate surfaced by `GET /api/import/candidates`.
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct ImportCandidate {
    /// Directory name under `.worktrees/`.
    pub name: String,
    /// The branch it's checked out to, if it's a valid git worktree.
    pub branch: Option<String>,
}

/// Body of `POST /api/import`.
#[typeshare]
#[derive(Debug, Clone, Deserialize)]
pub struct ImportRequest {
    /// Directory name, as returned by [`ImportCandidate::name`].
    pub name: String,
}

/// 409 body returned when `POST /api/worktrees` is rejected because the root
/// worktree is stale against its upstream (§6, §8 scenario 4).
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct NeedsSyncBody {
    /// Always `true`; present so the shape is self-describing on the wire.
    pub needs_sync: bool,
    /// Commits `origin/<base>` is ahead of the root worktree.
    pub commits_behind: u32,
    /// Whether the root worktree also has uncommitted changes.
    pub has_dirty_state: bool,
    /// Human-readable summary, e.g. `"main is 5 commits behind origin/main"`.
    pub message: String,
}
