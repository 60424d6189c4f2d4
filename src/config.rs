//! Layered configuration (§10.3): built-in defaults, then
//! `<project-root>/.vibetrees/config.toml`, then `VIBETREES_*` environment
//! variables, then CLI flags — each layer overriding only the fields it sets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Feature flags toggling optional pipeline behavior (§10.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Whether startup reconciles the port registry against `git worktree
    /// list` automatically (I-R3).
    pub enable_auto_reconcile: bool,
    /// Whether W-Create runs W-DbCopy (§4.W).
    pub enable_db_seed_copy: bool,
    /// Whether W-Create writes an AI-assistant config file (step 9).
    pub enable_ai_assistant_config: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_auto_reconcile: true,
            enable_db_seed_copy: true,
            enable_ai_assistant_config: true,
        }
    }
}

/// Fully resolved configuration for one daemon process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the git repository being branched.
    pub project_root: PathBuf,
    /// Compose file describing the per-worktree services.
    pub compose_file: PathBuf,
    /// Base branch staleness and sync checks compare against (default `main`).
    pub base_branch: String,
    /// On-disk location of the port registry (R, §6).
    pub port_registry_path: PathBuf,
    /// Upper bound on retained PTY scrollback, in bytes.
    pub pty_scrollback_cap: usize,
    /// `tracing` `EnvFilter` directive, e.g. `vibetrees=info`.
    pub log_level: String,
    /// How often the PTY orphan sweeper runs.
    pub orphan_sweep_interval: Duration,
    /// Container runtime CLI to shell out to (`docker`, `podman`, ...).
    pub container_runtime: String,
    /// Optional feature toggles.
    pub feature_flags: FeatureFlags,
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The project config file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// The project config file is not valid TOML, or fails its schema.
    #[error("malformed config at {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
    /// An env var or CLI flag carried a value that doesn't parse into its
    /// target type. Config loading never silently falls back to a default
    /// for an explicitly-set value.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Name of the offending field/env var.
        field: &'static str,
        /// Human-readable detail.
        message: String,
    },
}

/// CLI-flag overrides, applied last (highest priority).
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// `--base-branch`.
    pub base_branch: Option<String>,
    /// `--compose-file`.
    pub compose_file: Option<PathBuf>,
    /// `--port-registry`.
    pub port_registry_path: Option<PathBuf>,
    /// `--log-level`.
    pub log_level: Option<String>,
    /// `--runtime`.
    pub container_runtime: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    base_branch: Option<String>,
    compose_file: Option<String>,
    port_registry_path: Option<String>,
    pty_scrollback_cap: Option<usize>,
    log_level: Option<String>,
    orphan_sweep_interval_secs: Option<u64>,
    container_runtime: Option<String>,
    feature_flags: Option<RawFeatureFlags>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFeatureFlags {
    enable_auto_reconcile: Option<bool>,
    enable_db_seed_copy: Option<bool>,
    enable_ai_assistant_config: Option<bool>,
}

impl Config {
    /// Resolves configuration for `project_root`, applying all four layers
    /// in priority order.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`]/[`ConfigError::Parse`] if the project
    /// config file exists but is unreadable or malformed, or
    /// [`ConfigError::InvalidValue`] if an env var carries an unparsable
    /// value.
    pub fn load(project_root: &Path, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(project_root);

        let project_config_path = project_root.join(".vibetrees").join("config.toml");
        if project_config_path.exists() {
            let text = std::fs::read_to_string(&project_config_path)
                .map_err(|source| ConfigError::Read { path: project_config_path.clone(), source })?;
            let raw: RawConfig = toml::from_str(&text)
                .map_err(|source| ConfigError::Parse { path: project_config_path.clone(), source })?;
            config.apply_raw(raw, project_root);
        }

        config.apply_env()?;
        config.apply_overrides(overrides);

        Ok(config)
    }

    fn defaults(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            compose_file: project_root.join("docker-compose.yml"),
            base_branch: "main".to_owned(),
            port_registry_path: crate::utils::paths::port_registry_path(project_root),
            pty_scrollback_cap: 1 << 20,
            log_level: "vibetrees=info".to_owned(),
            orphan_sweep_interval: Duration::from_secs(600),
            container_runtime: "docker".to_owned(),
            feature_flags: FeatureFlags::default(),
        }
    }

    fn apply_raw(&mut self, raw: RawConfig, project_root: &Path) {
        if let Some(v) = raw.base_branch {
            self.base_branch = v;
        }
        if let Some(v) = raw.compose_file {
            self.compose_file = project_root.join(v);
        }
        if let Some(v) = raw.port_registry_path {
            self.port_registry_path = project_root.join(v);
        }
        if let Some(v) = raw.pty_scrollback_cap {
            self.pty_scrollback_cap = v;
        }
        if let Some(v) = raw.log_level {
            self.log_level = v;
        }
        if let Some(v) = raw.orphan_sweep_interval_secs {
            self.orphan_sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = raw.container_runtime {
            self.container_runtime = v;
        }
        if let Some(flags) = raw.feature_flags {
            if let Some(v) = flags.enable_auto_reconcile {
                self.feature_flags.enable_auto_reconcile = v;
            }
            if let Some(v) = flags.enable_db_seed_copy {
                self.feature_flags.enable_db_seed_copy = v;
            }
            if let Some(v) = flags.enable_ai_assistant_config {
                self.feature_flags.enable_ai_assistant_config = v;
            }
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("VIBETREES_BASE_BRANCH") {
            self.base_branch = v;
        }
        if let Ok(v) = std::env::var("VIBETREES_COMPOSE_FILE") {
            self.compose_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VIBETREES_PORT_REGISTRY_PATH") {
            self.port_registry_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VIBETREES_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("VIBETREES_CONTAINER_RUNTIME") {
            self.container_runtime = v;
        }
        if let Ok(v) = std::env::var("VIBETREES_PTY_SCROLLBACK_CAP") {
            self.pty_scrollback_cap = v.parse().map_err(|_| ConfigError::InvalidValue {
                field: "VIBETREES_PTY_SCROLLBACK_CAP",
                message: format!("{v:?} is not a byte count"),
            })?;
        }
        if let Ok(v) = std::env::var("VIBETREES_ORPHAN_SWEEP_INTERVAL_SECS") {
            let secs: u64 = v.parse().map_err(|_| ConfigError::InvalidValue {
                field: "VIBETREES_ORPHAN_SWEEP_INTERVAL_SECS",
                message: format!("{v:?} is not an integer"),
            })?;
            self.orphan_sweep_interval = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("VIBETREES_ENABLE_AUTO_RECONCILE") {
            self.feature_flags.enable_auto_reconcile = parse_bool_env("VIBETREES_ENABLE_AUTO_RECONCILE", &v)?;
        }
        if let Ok(v) = std::env::var("VIBETREES_ENABLE_DB_SEED_COPY") {
            self.feature_flags.enable_db_seed_copy = parse_bool_env("VIBETREES_ENABLE_DB_SEED_COPY", &v)?;
        }
        if let Ok(v) = std::env::var("VIBETREES_ENABLE_AI_ASSISTANT_CONFIG") {
            self.feature_flags.enable_ai_assistant_config =
                parse_bool_env("VIBETREES_ENABLE_AI_ASSISTANT_CONFIG", &v)?;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(v) = &overrides.base_branch {
            self.base_branch = v.clone();
        }
        if let Some(v) = &overrides.compose_file {
            self.compose_file = v.clone();
        }
        if let Some(v) = &overrides.port_registry_path {
            self.port_registry_path = v.clone();
        }
        if let Some(v) = &overrides.log_level {
            self.log_level = v.clone();
        }
        if let Some(v) = &overrides.container_runtime {
            self.container_runtime = v.clone();
        }
    }
}

fn parse_bool_env(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "TRUE" | "yes" => Ok(true),
        "0" | "false" | "FALSE" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue { field, message: format!("{other:?} is not a boolean") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_rooted_at_project() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.compose_file, dir.path().join("docker-compose.yml"));
    }

    #[test]
    fn project_config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetrees")).unwrap();
        std::fs::write(
            dir.path().join(".vibetrees/config.toml"),
            "base_branch = \"trunk\"\n[feature_flags]\nenable_db_seed_copy = false\n",
        )
        .unwrap();

        let config = Config::load(dir.path(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.base_branch, "trunk");
        assert!(!config.feature_flags.enable_db_seed_copy);
        assert!(config.feature_flags.enable_auto_reconcile);
    }

    #[test]
    fn cli_overrides_win_over_everything() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetrees")).unwrap();
        std::fs::write(dir.path().join(".vibetrees/config.toml"), "base_branch = \"trunk\"\n").unwrap();

        let overrides = ConfigOverrides { base_branch: Some("release".to_owned()), ..Default::default() };
        let config = Config::load(dir.path(), &overrides).unwrap();
        assert_eq!(config.base_branch, "release");
    }

    #[test]
    fn malformed_toml_is_an_error_not_a_silent_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".vibetrees")).unwrap();
        std::fs::write(dir.path().join(".vibetrees/config.toml"), "this is not toml =not=").unwrap();

        let result = Config::load(dir.path(), &ConfigOverrides::default());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
