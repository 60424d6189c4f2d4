//! The `Worktree` data model (§3) and its lifecycle state machine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Root worktree name; designates the original checkout (I-W2). Never
/// deletable.
pub const ROOT_WORKTREE_NAME: &str = "main";

/// Summary git status of a worktree's working tree.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitStatus {
    /// No uncommitted changes.
    Clean,
    /// Uncommitted changes present.
    Uncommitted,
    /// Committed but not pushed to the branch's upstream.
    Unpushed,
    /// Status could not be determined.
    Unknown,
}

/// Container-status snapshot for a worktree's compose project (§3): orthogonal
/// to [`WorktreeState`] — a `ready` worktree may have every service stopped.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Every declared service is running.
    Running,
    /// At least one service is running, at least one is not.
    Partial,
    /// No service is running (or none has ever been started).
    Stopped,
    /// The runtime could not be queried (e.g. no `.env` yet, or a runtime error).
    Unknown,
}

/// The lifecycle state of a worktree (§4.W "State machine of a worktree").
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeState {
    /// Not present on disk or in the registry.
    Absent,
    /// A create/import pipeline is running.
    Materializing,
    /// Checked out and registered; container state is orthogonal.
    Ready,
    /// A sync pipeline is running.
    Syncing,
    /// A delete pipeline is running.
    Deleting,
}

/// One commit's summary, as used for `last_commit`.
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCommit {
    /// Abbreviated SHA.
    pub sha: String,
    /// First line of the message.
    pub message: String,
    /// Author time.
    pub authored_at: DateTime<Utc>,
}

/// A worktree (§3): a branch checkout plus the ports, container status, and
/// git-status summary scoped to it.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    /// Slugified branch name; unique across all live worktrees (I-W1).
    pub name: String,
    /// Absolute path on disk.
    #[typeshare(serialized_as = "String")]
    pub path: PathBuf,
    /// The git branch checked out here.
    pub branch: String,
    /// Service-identifier -> published port.
    pub ports: BTreeMap<String, u16>,
    /// Current lifecycle state.
    pub state: WorktreeState,
    /// Container-status snapshot, orthogonal to `state`.
    pub container_status: ContainerStatus,
    /// Summary git status.
    pub git_status: GitStatus,
    /// Commits ahead of the base branch.
    pub ahead: u32,
    /// Commits behind the base branch.
    pub behind: u32,
    /// Count of modified tracked files.
    pub modified_count: u32,
    /// Count of untracked files.
    pub untracked_count: u32,
    /// Most recent commit, if known.
    pub last_commit: Option<LastCommit>,
    /// The `origin` remote URL, if known.
    pub remote_url: Option<String>,
    /// Timestamp this snapshot was produced.
    pub updated_at: DateTime<Utc>,
}

impl Worktree {
    /// True for the root checkout (I-W2): never deletable.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.name == ROOT_WORKTREE_NAME
    }
}

/// Preflight summary surfaced before a worktree is closed, so an operator can
/// see what would be lost before confirming (§4.W close-info).
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseInfo {
    /// The worktree this summary describes.
    pub name: String,
    /// True if the branch has already landed on the base branch
    /// (`git merge-base --is-ancestor`).
    pub merged: bool,
    /// True if there are uncommitted changes that would be discarded.
    pub has_dirty_state: bool,
    /// Unresolved merge-conflict paths, if any are outstanding.
    pub conflicts: Vec<String>,
}
