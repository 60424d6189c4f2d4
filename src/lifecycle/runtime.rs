//! Abstraction over the container runtime CLI (`docker`/`podman compose`),
//! so [`super::WorktreeLifecycle`] pipelines are testable without a real
//! runtime (§10.4), mirroring [`crate::git::GitOperations`]'s shell-out
//! abstraction.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::utils::command::{CommandOutput, RunOptions, run_command, run_command_with};

/// Errors from runtime shell-outs.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime CLI exited non-zero; stderr preserved verbatim.
    #[error("runtime {command} failed: {stderr}")]
    CommandFailed {
        /// The subcommand invoked (e.g. `"compose up"`).
        command: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Underlying process/IO error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Container runtime operations [`super::WorktreeLifecycle`] needs: compose
/// lifecycle commands plus the narrow exec/cp surface W-DbCopy shells out
/// through.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// `runtime compose --env-file <env_file> up -d`, streaming output.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn compose_up(&self, project_dir: &Path, env_file: &Path) -> Result<CommandOutput, RuntimeError>;

    /// `runtime compose --env-file <env_file> down -v --rmi local`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn compose_down(&self, project_dir: &Path, env_file: &Path) -> Result<CommandOutput, RuntimeError>;

    /// `runtime compose --env-file <env_file> stop [service]`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn compose_stop(&self, project_dir: &Path, env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError>;

    /// `runtime compose --env-file <env_file> start [service]`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn compose_start(&self, project_dir: &Path, env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError>;

    /// `runtime compose --env-file <env_file> restart [service]`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn compose_restart(&self, project_dir: &Path, env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError>;

    /// `runtime compose --env-file <env_file> up -d --build --no-deps
    /// <service>`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn compose_rebuild(&self, project_dir: &Path, env_file: &Path, service: &str) -> Result<CommandOutput, RuntimeError>;

    /// Whether `container` is currently in the `running` state, per `runtime
    /// inspect -f {{.State.Running}}`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] if the container does not
    /// exist or the runtime call otherwise fails.
    async fn is_running(&self, container: &str) -> Result<bool, RuntimeError>;

    /// Runs `args` inside `container` (`runtime exec <container> <args...>`).
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn exec(&self, container: &str, args: &[&str]) -> Result<CommandOutput, RuntimeError>;

    /// Copies `src` out of `container` to `dst` on the host (`runtime cp
    /// container:src dst`).
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn cp_from(&self, container: &str, src: &str, dst: &Path) -> Result<(), RuntimeError>;

    /// Copies `src` on the host into `container` at `dst` (`runtime cp src
    /// container:dst`).
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn cp_to(&self, container: &str, src: &Path, dst: &str) -> Result<(), RuntimeError>;

    /// Per-service running state for the project's container-status snapshot
    /// (§3), via `runtime compose --env-file <env_file> ps --format json`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::CommandFailed`] on a non-zero exit.
    async fn compose_ps(&self, project_dir: &Path, env_file: &Path) -> Result<Vec<ServiceState>, RuntimeError>;
}

/// One service's running state, as reported by `compose ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    /// Compose service name.
    pub service: String,
    /// True if the service's container is in the `running` state.
    pub running: bool,
}

/// The conventional container name the runtime assigns a compose service's
/// first instance: `<project_name>-<service>-1` (or `<project>_<service>_1`
/// for the legacy underscore naming some installs still use). Callers that
/// need the legacy form should try both names against [`RuntimeBackend::is_running`].
#[must_use]
pub fn container_name(project_name: &str, service: &str, index: u32) -> String {
    format!("{project_name}-{service}-{index}")
}

/// Shells out to a real container runtime CLI (`docker`, `podman`, ...).
#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    runtime: String,
}

impl ComposeRuntime {
    /// Creates a runtime backed by `runtime` (e.g. `"docker"`).
    #[must_use]
    pub fn new(runtime: impl Into<String>) -> Self {
        Self { runtime: runtime.into() }
    }

    async fn compose(
        &self,
        project_dir: &Path,
        env_file: &Path,
        args: &[&str],
        label: &str,
    ) -> Result<CommandOutput, RuntimeError> {
        let env_file_str = env_file.to_string_lossy().into_owned();
        let mut full_args: Vec<&str> = vec!["compose", "--env-file", env_file_str.as_str()];
        full_args.extend_from_slice(args);

        let output = run_command_with(
            &self.runtime,
            &full_args,
            RunOptions { cwd: Some(project_dir), ..Default::default() },
        )
        .await
        .map_err(RuntimeError::Other)?;

        if output.success() {
            Ok(output)
        } else {
            Err(RuntimeError::CommandFailed { command: label.to_owned(), stderr: output.stderr })
        }
    }
}

#[async_trait]
impl RuntimeBackend for ComposeRuntime {
    async fn compose_up(&self, project_dir: &Path, env_file: &Path) -> Result<CommandOutput, RuntimeError> {
        self.compose(project_dir, env_file, &["up", "-d"], "compose up").await
    }

    async fn compose_down(&self, project_dir: &Path, env_file: &Path) -> Result<CommandOutput, RuntimeError> {
        self.compose(project_dir, env_file, &["down", "-v", "--rmi", "local"], "compose down").await
    }

    async fn compose_stop(&self, project_dir: &Path, env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError> {
        let mut args = vec!["stop"];
        if let Some(s) = service {
            args.push(s);
        }
        self.compose(project_dir, env_file, &args, "compose stop").await
    }

    async fn compose_start(&self, project_dir: &Path, env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError> {
        let mut args = vec!["start"];
        if let Some(s) = service {
            args.push(s);
        }
        self.compose(project_dir, env_file, &args, "compose start").await
    }

    async fn compose_restart(&self, project_dir: &Path, env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError> {
        let mut args = vec!["restart"];
        if let Some(s) = service {
            args.push(s);
        }
        self.compose(project_dir, env_file, &args, "compose restart").await
    }

    async fn compose_rebuild(&self, project_dir: &Path, env_file: &Path, service: &str) -> Result<CommandOutput, RuntimeError> {
        self.compose(project_dir, env_file, &["up", "-d", "--build", "--no-deps", service], "compose rebuild").await
    }

    async fn compose_ps(&self, project_dir: &Path, env_file: &Path) -> Result<Vec<ServiceState>, RuntimeError> {
        let output = self.compose(project_dir, env_file, &["ps", "--format", "json"], "compose ps").await?;
        // `compose ps --format json` emits one JSON object per line (ndjson),
        // not a single array; an empty project produces no lines at all.
        let services = output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|v| {
                let service = v.get("Service").and_then(|s| s.as_str())?.to_owned();
                let state = v.get("State").and_then(|s| s.as_str()).unwrap_or_default();
                Some(ServiceState { service, running: state == "running" })
            })
            .collect();
        Ok(services)
    }

    async fn is_running(&self, container: &str) -> Result<bool, RuntimeError> {
        let output = run_command(&self.runtime, &["inspect", "-f", "{{.State.Running}}", container], None)
            .await
            .map_err(RuntimeError::Other)?;
        if !output.success() {
            return Ok(false);
        }
        Ok(output.stdout.trim() == "true")
    }

    async fn exec(&self, container: &str, args: &[&str]) -> Result<CommandOutput, RuntimeError> {
        let mut full_args = vec!["exec", container];
        full_args.extend_from_slice(args);
        let output = run_command(&self.runtime, &full_args, None).await.map_err(RuntimeError::Other)?;
        if output.success() {
            Ok(output)
        } else {
            Err(RuntimeError::CommandFailed { command: "exec".into(), stderr: output.stderr })
        }
    }

    async fn cp_from(&self, container: &str, src: &str, dst: &Path) -> Result<(), RuntimeError> {
        let dst_str = dst.to_string_lossy().into_owned();
        let source = format!("{container}:{src}");
        let output = run_command(&self.runtime, &["cp", &source, &dst_str], None).await.map_err(RuntimeError::Other)?;
        if output.success() {
            Ok(())
        } else {
            Err(RuntimeError::CommandFailed { command: "cp".into(), stderr: output.stderr })
        }
    }

    async fn cp_to(&self, container: &str, src: &Path, dst: &str) -> Result<(), RuntimeError> {
        let src_str = src.to_string_lossy().into_owned();
        let target = format!("{container}:{dst}");
        let output = run_command(&self.runtime, &["cp", &src_str, &target], None).await.map_err(RuntimeError::Other)?;
        if output.success() {
            Ok(())
        } else {
            Err(RuntimeError::CommandFailed { command: "cp".into(), stderr: output.stderr })
        }
    }
}

/// In-memory mock of [`RuntimeBackend`] for pipeline tests (§10.4), mirroring
/// [`crate::git::mock::MockGit`].
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::{CommandOutput, RuntimeBackend, RuntimeError, ServiceState};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;

    /// Scripted, in-memory [`RuntimeBackend`].
    #[derive(Default)]
    pub struct MockRuntime {
        /// Containers considered to be running.
        pub running: Mutex<HashSet<String>>,
        /// Every call made, in order, for assertions (`"compose_up"`, ...).
        pub calls: Mutex<Vec<String>>,
        /// Scripted `compose_ps` response; empty by default (no services).
        pub service_states: Mutex<Vec<ServiceState>>,
    }

    fn ok() -> CommandOutput {
        CommandOutput { exit_code: 0, stdout: String::new(), stderr: String::new() }
    }

    #[async_trait]
    impl RuntimeBackend for MockRuntime {
        async fn compose_up(&self, _project_dir: &Path, _env_file: &Path) -> Result<CommandOutput, RuntimeError> {
            self.calls.lock().unwrap().push("compose_up".into());
            Ok(ok())
        }

        async fn compose_down(&self, _project_dir: &Path, _env_file: &Path) -> Result<CommandOutput, RuntimeError> {
            self.calls.lock().unwrap().push("compose_down".into());
            Ok(ok())
        }

        async fn compose_stop(&self, _project_dir: &Path, _env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError> {
            self.calls.lock().unwrap().push(format!("compose_stop:{}", service.unwrap_or("*")));
            if let Some(s) = service {
                self.running.lock().unwrap().remove(s);
            }
            Ok(ok())
        }

        async fn compose_start(&self, _project_dir: &Path, _env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError> {
            self.calls.lock().unwrap().push(format!("compose_start:{}", service.unwrap_or("*")));
            Ok(ok())
        }

        async fn compose_restart(&self, _project_dir: &Path, _env_file: &Path, service: Option<&str>) -> Result<CommandOutput, RuntimeError> {
            self.calls.lock().unwrap().push(format!("compose_restart:{}", service.unwrap_or("*")));
            Ok(ok())
        }

        async fn compose_rebuild(&self, _project_dir: &Path, _env_file: &Path, service: &str) -> Result<CommandOutput, RuntimeError> {
            self.calls.lock().unwrap().push(format!("compose_rebuild:{service}"));
            Ok(ok())
        }

        async fn compose_ps(&self, _project_dir: &Path, _env_file: &Path) -> Result<Vec<ServiceState>, RuntimeError> {
            self.calls.lock().unwrap().push("compose_ps".into());
            Ok(self.service_states.lock().unwrap().clone())
        }

        async fn is_running(&self, container: &str) -> Result<bool, RuntimeError> {
            Ok(self.running.lock().unwrap().contains(container))
        }

        async fn exec(&self, container: &str, args: &[&str]) -> Result<CommandOutput, RuntimeError> {
            self.calls.lock().unwrap().push(format!("exec:{container}:{}", args.join(" ")));
            Ok(ok())
        }

        async fn cp_from(&self, container: &str, src: &str, _dst: &Path) -> Result<(), RuntimeError> {
            self.calls.lock().unwrap().push(format!("cp_from:{container}:{src}"));
            Ok(())
        }

        async fn cp_to(&self, container: &str, _src: &Path, dst: &str) -> Result<(), RuntimeError> {
            self.calls.lock().unwrap().push(format!("cp_to:{container}:{dst}"));
            Ok(())
        }
    }

    impl MockRuntime {
        /// Marks `container` as running, for a test that needs W-DbCopy's
        /// readiness poll to succeed immediately.
        pub fn set_running(&self, container: impl Into<String>) {
            self.running.lock().unwrap().insert(container.into());
        }

        /// Scripts the response `compose_ps` returns, for a test exercising
        /// `WorktreeLifecycle`'s container-status snapshot.
        pub fn set_service_states(&self, states: Vec<ServiceState>) {
            *self.service_states.lock().unwrap() = states;
        }
    }
}
