//! Bounded-rate log forwarding from container processes to WebSocket
//! clients (§4.P LogStreamer).

use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Log level inferred from a line's content, used for color-coded
/// formatting by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// No recognizable level keyword.
    Unknown,
}

fn infer_level(line: &str) -> LogLevel {
    let upper = line.to_uppercase();
    if upper.contains("ERROR") || upper.contains("ERR ") {
        LogLevel::Error
    } else if upper.contains("WARN") {
        LogLevel::Warn
    } else if upper.contains("INFO") {
        LogLevel::Info
    } else if upper.contains("DEBUG") {
        LogLevel::Debug
    } else {
        LogLevel::Unknown
    }
}

/// A single tagged log line delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    /// The originating service, if scoped to one.
    pub service: Option<String>,
    /// Inferred level for color-coding.
    pub level: LogLevel,
    /// The raw line text (timestamp prefix included, if the runtime adds
    /// one; the client colors it gray).
    pub text: String,
}

/// Shells out to `runtime compose logs -f --tail=100 [service]`, tags and
/// buffers each line, and fans it out to subscribers. Cancellable: when the
/// last subscriber detaches, the child is signalled to terminate.
pub struct LogStreamer {
    cancel: CancellationToken,
    sender: broadcast::Sender<LogLine>,
    subscriber_count: Arc<std::sync::atomic::AtomicUsize>,
}

impl LogStreamer {
    /// Starts streaming logs for `worktree`'s compose project, optionally
    /// scoped to `service`.
    ///
    /// # Errors
    /// Returns an error if the `logs -f` child process cannot be spawned.
    pub async fn start(runtime: &str, env_file: &std::path::Path, service: Option<&str>) -> anyhow::Result<Self> {
        let env_file_str = env_file.to_string_lossy().into_owned();
        let mut args = vec!["compose", "--env-file", env_file_str.as_str(), "logs", "-f", "--tail=100"];
        if let Some(svc) = service {
            args.push(svc);
        }

        let mut cmd = Command::new(runtime);
        cmd.args(&args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let service_owned = service.map(str::to_owned);

        let (sender, _) = broadcast::channel::<LogLine>(4096);
        let cancel = CancellationToken::new();
        let subscriber_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let task_cancel = cancel.clone();
        let task_sender = sender.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            // A partial trailing line is buffered by `BufReader::lines`
            // itself until a newline arrives or the stream ends.
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(text)) => {
                                let level = infer_level(&text);
                                let _ = task_sender.send(LogLine { service: service_owned.clone(), level, text });
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!("log streamer child exited");
        });

        Ok(Self { cancel, sender, subscriber_count })
    }

    /// Subscribes a client to this streamer's lines.
    #[must_use]
    pub fn subscribe(&self) -> LogSubscription {
        self.subscriber_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        LogSubscription {
            receiver: self.sender.subscribe(),
            subscriber_count: Arc::clone(&self.subscriber_count),
            cancel: self.cancel.clone(),
        }
    }

    /// True once the child has been signalled to terminate (the last
    /// subscriber detached, or the manager is tearing this entry down).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Key identifying one live log stream: a worktree, optionally scoped to a
/// single compose service.
type LogStreamKey = (String, Option<String>);

/// Reuses one [`LogStreamer`] child per `(worktree, service)` pair across
/// concurrently connected WebSocket clients, mirroring
/// [`crate::pty::PtySessionManager`]'s `getOrCreate` registry.
pub struct LogStreamerManager {
    runtime: String,
    streams: tokio::sync::Mutex<std::collections::HashMap<LogStreamKey, Arc<LogStreamer>>>,
}

impl LogStreamerManager {
    /// Creates a manager that shells out to `runtime` (e.g. `"docker"`).
    #[must_use]
    pub fn new(runtime: impl Into<String>) -> Self {
        Self { runtime: runtime.into(), streams: tokio::sync::Mutex::new(std::collections::HashMap::new()) }
    }

    /// Returns a subscription to the existing stream for `(worktree,
    /// service)`, starting one against `env_file` if none is live.
    ///
    /// # Errors
    /// Returns an error if a new `logs -f` child fails to spawn.
    pub async fn subscribe(
        &self,
        env_file: &std::path::Path,
        worktree: &str,
        service: Option<&str>,
    ) -> anyhow::Result<LogSubscription> {
        let key = (worktree.to_owned(), service.map(str::to_owned));
        let mut streams = self.streams.lock().await;
        if let Some(existing) = streams.get(&key)
            && !existing.is_cancelled()
        {
            return Ok(existing.subscribe());
        }
        let streamer = Arc::new(LogStreamer::start(&self.runtime, env_file, service).await?);
        let subscription = streamer.subscribe();
        streams.insert(key, streamer);
        Ok(subscription)
    }
}

/// A subscriber handle; dropping it detaches from the streamer, and if it
/// was the last subscriber the underlying `logs -f` process is cancelled.
pub struct LogSubscription {
    /// The underlying broadcast receiver.
    pub receiver: broadcast::Receiver<LogLine>,
    subscriber_count: Arc<std::sync::atomic::AtomicUsize>,
    cancel: CancellationToken,
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if self.subscriber_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1 {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_level_from_line_content() {
        assert_eq!(infer_level("2024-01-01 ERROR something broke"), LogLevel::Error);
        assert_eq!(infer_level("INFO starting up"), LogLevel::Info);
        assert_eq!(infer_level("just some text"), LogLevel::Unknown);
    }
}
