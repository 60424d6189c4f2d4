/// Unified shell-out abstraction used by every component that drives git or
/// the container runtime.
pub mod command;
/// Directory listing, tilde expansion, path normalization helpers.
pub mod directory;
/// Git root/worktree detection helpers.
pub mod git;
/// HTTP-over-Unix-socket client for the thin CLI subcommands.
pub mod ipc;
/// Daemon data-directory layout (`~/.vibetrees/...`).
pub mod paths;
/// Branch-name slugification.
pub mod slug;

pub use command::{CommandOutput, run_command, run_command_with};
pub use directory::{expand_tilde, normalize_path, read_directories};
pub use slug::slugify;
