//! The external boundary (component E, §6): wires the Control API's HTTP
//! routes and the four WebSocket surfaces onto an [`AppState`] built from
//! every other core component.

pub mod error_response;
pub mod handlers;
pub mod state;
pub mod types;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

pub use state::AppState;

use crate::validate::InputValidator;
use crate::validate::sanitize::SecretSanitizer;

/// Sanitizes a raw terminal byte chunk before it leaves the core (§4):
/// decoded lossily since PTY output is not guaranteed valid UTF-8, sanitized
/// as text, then re-encoded. Invalid byte sequences become `U+FFFD`, which
/// only affects display of already-malformed escape sequences.
fn sanitize_bytes(sanitizer: &SecretSanitizer, bytes: &[u8]) -> Vec<u8> {
    sanitizer.sanitize(&String::from_utf8_lossy(bytes)).text.into_bytes()
}

/// Builds the full Control API router (§6): the worktree/compose/diagnostics
/// HTTP surface plus the four WebSocket endpoints (control events, terminal,
/// combined logs, per-service logs).
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/worktrees", get(handlers::list_worktrees).post(handlers::create_worktree))
        .route("/api/worktrees/{name}", get(handlers::get_worktree).delete(handlers::delete_worktree))
        .route("/api/worktrees/{name}/close-info", get(handlers::close_info))
        .route("/api/worktrees/{name}/conflicts", get(handlers::conflicts))
        .route("/api/worktrees/{name}/updates", get(handlers::fetch_updates))
        .route("/api/worktrees/{name}/sync", post(handlers::sync_worktree))
        .route("/api/worktrees/{name}/rollback", post(handlers::rollback_worktree))
        .route("/api/worktrees/{name}/services/start", post(handlers::start_services))
        .route("/api/worktrees/{name}/services/stop", post(handlers::stop_services))
        .route("/api/worktrees/{name}/services/restart", post(handlers::restart_all_services))
        .route("/api/worktrees/{name}/services/{service}/restart", post(handlers::restart_service))
        .route("/api/worktrees/{name}/services/{service}/rebuild", post(handlers::rebuild_service))
        .route("/api/compose/services", get(handlers::compose_services))
        .route("/api/diagnostics", get(handlers::run_diagnostics))
        .route("/api/diagnostics/{id}/fix", post(handlers::fix_diagnostic))
        .route("/api/import/candidates", get(handlers::import_candidates))
        .route("/api/import", post(handlers::import_worktree))
        .route("/", get(control_events_ws))
        .route("/terminal/{worktree}", get(terminal_ws))
        .route("/logs/{worktree}", get(combined_logs_ws))
        .route("/logs/{worktree}/{service}", get(service_logs_ws))
        .with_state(state)
}

/// `/` — fans out every [`crate::progress::ProgressEvent`] emitted by any
/// pipeline to this client, in emission order (no durability, no replay of
/// events from before the subscribe call, per §4.B).
async fn control_events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| control_events_loop(socket, state))
}

async fn control_events_loop(mut socket: WebSocket, state: AppState) {
    let mut rx = state.bus.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "control events subscriber lagged, some events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                // The control socket is output-only from the server's
                // perspective; any client frame (typically a ping) just
                // keeps the connection alive. A close or error ends it.
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TerminalQuery {
    command: Option<String>,
}

/// A JSON control frame recognized on the terminal socket; any JSON object
/// that doesn't match this shape is treated as literal input bytes (§6).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalControlMessage {
    Resize { cols: u16, rows: u16 },
}

/// `/terminal/{worktree}?command={shell|claude|codex}` — bidirectional PTY
/// I/O. Text frames carry bytes to write; a `{"type":"resize",...}` JSON
/// frame resizes the PTY; any other JSON is treated as input (§6).
async fn terminal_ws(
    ws: WebSocketUpgrade,
    Path(worktree): Path<String>,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| terminal_loop(socket, state, worktree, query.command.unwrap_or_else(|| "shell".to_owned())))
}

async fn terminal_loop(mut socket: WebSocket, state: AppState, worktree: String, command: String) {
    if InputValidator::worktree_name(&worktree).is_err() {
        let _ = socket.send(Message::text("worktree name is invalid")).await;
        let _ = socket.close().await;
        return;
    }

    let worktree_path = crate::utils::paths::worktree_path(&state.config.project_root, &worktree);
    let session = match state.pty.get_or_create(&worktree, &command, &worktree_path).await {
        Ok(session) => session,
        Err(e) => {
            let _ = socket.send(Message::text(format!("failed to open terminal: {e}"))).await;
            let _ = socket.close().await;
            return;
        }
    };

    let (tail, mut output_rx) = session.subscribe().await;
    if !tail.is_empty() {
        let sanitized = sanitize_bytes(&state.sanitizer, &tail);
        if socket.send(Message::binary(sanitized)).await.is_err() {
            session.unsubscribe();
            return;
        }
    }

    loop {
        tokio::select! {
            chunk = output_rx.recv() => {
                match chunk {
                    Ok(bytes) => {
                        let sanitized = sanitize_bytes(&state.sanitizer, &bytes);
                        if socket.send(Message::binary(sanitized)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.to_string();
                        if let Ok(TerminalControlMessage::Resize { cols, rows }) = serde_json::from_str(&text) {
                            session.resize(rows, cols);
                        } else {
                            session.write(text.into_bytes());
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => session.write(bytes.into()),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                }
            }
        }
    }
    session.unsubscribe();
}

/// `/logs/{worktree}` — combined logs across every service in the project.
async fn combined_logs_ws(
    ws: WebSocketUpgrade,
    Path(worktree): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| logs_loop(socket, state, worktree, None))
}

/// `/logs/{worktree}/{service}` — logs scoped to one compose service.
async fn service_logs_ws(
    ws: WebSocketUpgrade,
    Path((worktree, service)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| logs_loop(socket, state, worktree, Some(service)))
}

async fn logs_loop(mut socket: WebSocket, state: AppState, worktree: String, service: Option<String>) {
    if InputValidator::worktree_name(&worktree).is_err()
        || service.as_deref().is_some_and(|s| InputValidator::service_name(s).is_err())
    {
        let _ = socket.send(Message::text("invalid worktree or service name")).await;
        let _ = socket.close().await;
        return;
    }

    let env_file = crate::utils::paths::worktree_path(&state.config.project_root, &worktree).join(".env");
    let mut subscription = match state.log_streamers.subscribe(&env_file, &worktree, service.as_deref()).await {
        Ok(sub) => sub,
        Err(e) => {
            let _ = socket.send(Message::text(format!("failed to stream logs: {e}"))).await;
            let _ = socket.close().await;
            return;
        }
    };

    loop {
        tokio::select! {
            line = subscription.receiver.recv() => {
                match line {
                    Ok(mut line) => {
                        line.text = state.sanitizer.sanitize(&line.text).text;
                        let Ok(text) = serde_json::to_string(&line) else { continue };
                        if socket.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(worktree, service = ?service, "log subscriber detached");
}
