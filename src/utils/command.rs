//! Single shell-out abstraction every component uses to drive git and the
//! container runtime, replacing the mixed sync/streaming call sites the
//! source repo scattered across its backends.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Captured result of a completed child process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code, or `-1` if the process was killed without one.
    pub exit_code: i32,
    /// Captured stdout, UTF-8 lossy.
    pub stdout: String,
    /// Captured stderr, UTF-8 lossy.
    pub stderr: String,
}

impl CommandOutput {
    /// True when the process exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Optional per-line callbacks and cancellation/timeout controls for
/// [`run_command_with`].
#[derive(Default)]
pub struct RunOptions<'a> {
    /// Working directory for the child process.
    pub cwd: Option<&'a Path>,
    /// Hard deadline; the child is terminated (SIGTERM, then SIGKILL after a
    /// grace period) if it runs longer.
    pub timeout: Option<Duration>,
    /// Called once per stdout line as it is produced.
    pub on_stdout_line: Option<Box<dyn FnMut(&str) + Send>>,
    /// Called once per stderr line as it is produced.
    pub on_stderr_line: Option<Box<dyn FnMut(&str) + Send>>,
    /// Extra environment variables to set on the child.
    pub env: Vec<(String, String)>,
}

const KILL_GRACE: Duration = Duration::from_millis(500);

/// Runs `program` with `args`, waiting to completion with no deadline and no
/// line callbacks. Convenience wrapper around [`run_command_with`].
///
/// # Errors
/// Returns an error if the process cannot be spawned.
pub async fn run_command(program: &str, args: &[&str], cwd: Option<&Path>) -> Result<CommandOutput> {
    run_command_with(program, args, RunOptions {
        cwd,
        ..Default::default()
    })
    .await
}

/// Runs `program` with `args` under the given [`RunOptions`].
///
/// Captures stdout/stderr while also invoking the line callbacks as output is
/// produced, so callers that need streaming (container `up`/`logs`) and
/// callers that only need the final buffers share one code path. Honors
/// `options.timeout` by sending SIGTERM then, after [`KILL_GRACE`], `kill()`.
///
/// # Errors
/// Returns an error if the process cannot be spawned or if IO on its pipes
/// fails.
pub async fn run_command_with(
    program: &str,
    args: &[&str],
    mut options: RunOptions<'_>,
) -> Result<CommandOutput> {
    debug!(program, args = ?args, "shelling out");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = options.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in &options.env {
        cmd.env(k, v);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();

    let body = async {
        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => {
                            if let Some(cb) = options.on_stdout_line.as_mut() {
                                cb(&l);
                            }
                            stdout_buf.push_str(&l);
                            stdout_buf.push('\n');
                        }
                        Ok(None) => {}
                        Err(_) => {}
                    }
                }
                line = stderr_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => {
                            if let Some(cb) = options.on_stderr_line.as_mut() {
                                cb(&l);
                            }
                            stderr_buf.push_str(&l);
                            stderr_buf.push('\n');
                        }
                        Ok(None) => {}
                        Err(_) => {}
                    }
                }
                status = child.wait() => {
                    let status = status.context("failed waiting on child")?;
                    return Ok::<i32, anyhow::Error>(status.code().unwrap_or(-1));
                }
            }
        }
    };

    let exit_code = match options.timeout {
        Some(dur) => match timeout(dur, body).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                tokio::time::sleep(KILL_GRACE).await;
                let _ = child.kill().await;
                anyhow::bail!("{program} timed out after {dur:?}");
            }
        },
        None => body.await?,
    };

    Ok(CommandOutput {
        exit_code,
        stdout: stdout_buf,
        stderr: stderr_buf,
    })
}
