//! Shared state handed to every HTTP/WS handler, composing every core
//! component the Control API fronts (§6).

use std::sync::Arc;

use crate::compose::ComposeInspector;
use crate::config::Config;
use crate::diagnostics::{DiagnosticRunner, Importer};
use crate::git::GitOperations;
use crate::git::sync::SyncManager;
use crate::lifecycle::WorktreeLifecycle;
use crate::progress::ProgressBus;
use crate::pty::{LogStreamerManager, PtySessionManager};
use crate::validate::SecretSanitizer;

/// Everything a Control API handler needs, cloned cheaply per-request since
/// every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The worktree create/delete/service orchestrator.
    pub lifecycle: Arc<WorktreeLifecycle>,
    /// Raw git access, for preflight checks the lifecycle doesn't itself
    /// expose (e.g. the create staleness check).
    pub git: Arc<dyn GitOperations>,
    /// Merge/rebase-against-base orchestrator.
    pub sync: Arc<SyncManager>,
    /// Compose file introspection, shared with the lifecycle's own instance.
    pub compose: Arc<ComposeInspector>,
    /// Live PTY session registry.
    pub pty: Arc<PtySessionManager>,
    /// Live log-stream registry backing `/logs/:worktree[/:service]`.
    pub log_streamers: Arc<LogStreamerManager>,
    /// Lifecycle event fan-out.
    pub bus: Arc<ProgressBus>,
    /// Orphaned-worktree-directory scanner.
    pub importer: Arc<Importer>,
    /// Named environment health checks.
    pub diagnostics: Arc<DiagnosticRunner>,
    /// Outbound string redaction.
    pub sanitizer: Arc<SecretSanitizer>,
    /// Resolved process configuration.
    pub config: Config,
}
