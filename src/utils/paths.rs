//! Daemon data-directory layout, rooted at `~/.vibetrees` (or
//! `$VIBETREES_HOME`).

use std::path::PathBuf;

/// Root of the daemon's per-user data directory.
#[must_use]
pub fn base_dir() -> PathBuf {
    if let Ok(custom) = std::env::var("VIBETREES_HOME") {
        return PathBuf::from(custom);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vibetrees")
}

/// Daily-rotating JSON log directory.
#[must_use]
pub fn logs_dir() -> PathBuf {
    base_dir().join("logs")
}

/// User-level config file (defaults layer below project config).
#[must_use]
pub fn config_path() -> PathBuf {
    base_dir().join("config.toml")
}

/// Project-scoped worktrees directory, rooted at the project (not the
/// per-user home), per SPEC_FULL.md §11.
#[must_use]
pub fn worktrees_dir(project_root: &std::path::Path) -> PathBuf {
    project_root.join(".worktrees")
}

/// Path to a single worktree's checkout directory.
#[must_use]
pub fn worktree_path(project_root: &std::path::Path, slug: &str) -> PathBuf {
    worktrees_dir(project_root).join(slug)
}

/// Port registry JSON file, relative to the project root (R, I-R2).
#[must_use]
pub fn port_registry_path(project_root: &std::path::Path) -> PathBuf {
    project_root.join(".vibetrees").join("port-registry.json")
}

/// Unix-domain control socket used for CLI ⇄ daemon IPC (§11).
#[must_use]
pub fn control_socket_path() -> PathBuf {
    base_dir().join("control.sock")
}
