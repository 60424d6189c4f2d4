//! Environment health checks and orphaned-worktree import (§4.D).

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};
use typeshare::typeshare;

use crate::config::Config;
use crate::lifecycle::WorktreeLifecycle;
use crate::worktree::Worktree;

use super::api::types::ImportCandidate;

/// Severity of a single diagnostic finding.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; no action required.
    Info,
    /// Worth attention but not blocking.
    Warning,
    /// Blocks normal operation until resolved.
    Error,
}

/// One named check's result (§4.D "DiagnosticRunner").
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// Stable identifier, e.g. `"port_registry_orphans"`.
    pub id: String,
    /// Severity of this finding.
    pub severity: Severity,
    /// Human-readable detail.
    pub message: String,
    /// Whether [`DiagnosticRunner::auto_fix`] can resolve this finding.
    pub autofixable: bool,
}

/// Result of [`DiagnosticRunner::auto_fix`].
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct AutoFixOutcome {
    /// The finding id that was targeted.
    pub id: String,
    /// Whether the fix applied successfully.
    pub fixed: bool,
    /// Human-readable detail of what was done (or why it couldn't be).
    pub message: String,
}

fn finding(id: &str, severity: Severity, message: impl Into<String>, autofixable: bool) -> Finding {
    Finding { id: id.to_owned(), severity, message: message.into(), autofixable }
}

/// Runs named, independent environment checks and can apply a narrow set of
/// auto-fixes. Each check is best-effort: a check that itself errors is
/// reported as an `Error`-severity finding rather than aborting the run.
pub struct DiagnosticRunner {
    git: std::sync::Arc<dyn crate::git::GitOperations>,
    ports: std::sync::Arc<crate::ports::PortRegistry>,
    compose: std::sync::Arc<crate::compose::ComposeInspector>,
}

impl DiagnosticRunner {
    /// Creates a runner composing the components its checks inspect.
    #[must_use]
    pub fn new(
        git: std::sync::Arc<dyn crate::git::GitOperations>,
        ports: std::sync::Arc<crate::ports::PortRegistry>,
        compose: std::sync::Arc<crate::compose::ComposeInspector>,
    ) -> Self {
        Self { git, ports, compose }
    }

    /// Runs every check and returns their findings, in a fixed, stable order.
    pub async fn run_all(&self, config: &Config) -> Vec<Finding> {
        let mut findings = Vec::new();
        findings.push(self.check_compose_file(config).await);
        findings.extend(self.check_registered_worktrees(config).await);
        findings.push(self.check_stale_compose_cache());
        findings
    }

    /// Applies the auto-fix for `id`, if it has one.
    ///
    /// # Errors
    /// Returns an error if `id` names no known check.
    pub async fn auto_fix(&self, id: &str, config: &Config) -> anyhow::Result<AutoFixOutcome> {
        match id {
            "stale_compose_cache" => {
                self.compose.clear_cache();
                Ok(AutoFixOutcome { id: id.to_owned(), fixed: true, message: "compose cache cleared".to_owned() })
            }
            "orphaned_port_registry_entries" => {
                let registered: Vec<String> =
                    self.git.list_worktrees().await?.into_iter().map(|(b, _)| crate::utils::slug::slugify(&b)).collect();
                self.ports.sync_from(&registered).await?;
                Ok(AutoFixOutcome { id: id.to_owned(), fixed: true, message: "pruned unregistered port-registry entries".to_owned() })
            }
            _ => anyhow::bail!("no auto-fix known for check {id:?}"),
        }
        .inspect(|outcome| info!(id = %outcome.id, "applied diagnostic auto-fix"))
    }

    async fn check_compose_file(&self, config: &Config) -> Finding {
        if !config.compose_file.exists() {
            return finding(
                "compose_file_missing",
                Severity::Error,
                format!("compose file not found at {}", config.compose_file.display()),
                false,
            );
        }
        match self.compose.services(&config.compose_file).await {
            Ok(services) if services.is_empty() => {
                finding("compose_file_empty", Severity::Warning, "compose file declares no services", false)
            }
            Ok(_) => finding("compose_file_valid", Severity::Info, "compose file parses cleanly", false),
            Err(e) => finding("compose_file_invalid", Severity::Error, e.to_string(), false),
        }
    }

    async fn check_registered_worktrees(&self, _config: &Config) -> Vec<Finding> {
        let Ok(registered) = self.git.list_worktrees().await else {
            return vec![finding("git_worktree_list_failed", Severity::Error, "git worktree list failed", false)];
        };
        let mut findings = Vec::new();
        for (branch, path) in &registered {
            if !path.exists() {
                findings.push(finding(
                    "worktree_registered_but_missing",
                    Severity::Warning,
                    format!("branch {branch} is registered at {} but the directory is absent", path.display()),
                    true,
                ));
            }
        }
        if findings.is_empty() {
            findings.push(finding("worktree_registrations_consistent", Severity::Info, "all registered worktrees exist on disk", false));
        }
        findings
    }

    fn check_stale_compose_cache(&self) -> Finding {
        finding(
            "stale_compose_cache",
            Severity::Info,
            "the compose inspector caches per-file parses for the process lifetime",
            true,
        )
    }
}

/// Scans `.worktrees/` for directories that are valid git worktrees but were
/// never registered through [`WorktreeLifecycle::create`] (§4.D "Importer").
pub struct Importer {
    git: std::sync::Arc<dyn crate::git::GitOperations>,
}

impl Importer {
    /// Creates an importer backed by `git`.
    #[must_use]
    pub fn new(git: std::sync::Arc<dyn crate::git::GitOperations>) -> Self {
        Self { git }
    }

    /// Lists directories under `.worktrees/` not already known to
    /// `git worktree list`, so an operator can decide which to adopt.
    ///
    /// # Errors
    /// Returns an error if the worktrees directory or git itself can't be
    /// read.
    pub async fn scan(&self, config: &Config) -> anyhow::Result<Vec<ImportCandidate>> {
        let base = crate::utils::paths::worktrees_dir(&config.project_root);
        if !base.exists() {
            return Ok(Vec::new());
        }

        let registered: std::collections::HashSet<std::path::PathBuf> =
            self.git.list_worktrees().await?.into_iter().map(|(_, p)| p).collect();

        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(&base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() || registered.contains(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let branch = current_branch(&path).await;
            candidates.push(ImportCandidate { name, branch });
        }
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(candidates)
    }

    /// Registers an already-checked-out directory under `.worktrees/<name>`
    /// with git, idempotently (repeated imports of an already-registered
    /// directory are a no-op success).
    ///
    /// # Errors
    /// Returns an error if `name` is not a valid git worktree, or the
    /// snapshot can't be produced afterward.
    pub async fn import(&self, name: &str, config: &Config, lifecycle: &WorktreeLifecycle) -> anyhow::Result<Worktree> {
        crate::validate::InputValidator::worktree_name(name)?;
        let path = crate::utils::paths::worktree_path(&config.project_root, name);
        if !path.join(".git").exists() {
            anyhow::bail!("{} is not a git worktree checkout", path.display());
        }

        let registered = self.git.list_worktrees().await?;
        if !registered.iter().any(|(_, p)| p == &path) {
            // `git worktree add` on an existing checkout fails; `repair`
            // re-links the gitdir pointer instead, which is the documented
            // remedy for adopting a manually-created worktree directory.
            self.git.repair_worktrees().await?;
            warn!(name, "ran worktree repair to adopt an unregistered directory");
        }

        lifecycle.list().await?.into_iter().find(|w| w.name == name).map_or_else(
            || anyhow::bail!("import of {name} did not produce a registered worktree"),
            Ok,
        )
    }
}

async fn current_branch(path: &Path) -> Option<String> {
    let output = crate::utils::command::run_command("git", &["rev-parse", "--abbrev-ref", "HEAD"], Some(path)).await.ok()?;
    if !output.success() {
        return None;
    }
    let branch = output.stdout.trim();
    if branch.is_empty() || branch == "HEAD" { None } else { Some(branch.to_owned()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::mock::MockGit;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn scan_skips_already_registered_directories() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path(), &crate::config::ConfigOverrides::default()).unwrap();
        let worktrees_dir = crate::utils::paths::worktrees_dir(dir.path());
        tokio::fs::create_dir_all(worktrees_dir.join("feat-a")).await.unwrap();
        tokio::fs::create_dir_all(worktrees_dir.join("feat-b")).await.unwrap();

        let git = Arc::new(MockGit::default());
        git.worktrees.lock().unwrap().insert("feat-a".to_owned(), worktrees_dir.join("feat-a"));

        let importer = Importer::new(git);
        let candidates = importer.scan(&config).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "feat-b");
    }
}
