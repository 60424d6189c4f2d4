//! HTTP handlers backing the Control API table of §6.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::diagnostics::AutoFixOutcome;
use crate::error::VibetreesError;
use crate::git::sync::SyncOutcome;
use crate::validate::InputValidator;
use crate::worktree::{CloseInfo, ROOT_WORKTREE_NAME, Worktree};

use super::error_response::ApiError;
use super::state::AppState;
use super::types::{
    CreateWorktreeRequest, CreateWorktreeResponse, ImportCandidate, ImportRequest, NeedsSyncBody,
    RollbackRequest, StartServicesResponse, SyncRequest,
};

fn validate_name(name: &str) -> Result<(), ApiError> {
    InputValidator::worktree_name(name)
        .map_err(|e| ApiError(VibetreesError::validation(e.to_string())))
}

/// `GET /api/worktrees`.
pub async fn list_worktrees(State(state): State<AppState>) -> Result<Json<Vec<Worktree>>, ApiError> {
    Ok(Json(state.lifecycle.list().await?))
}

/// `GET /api/worktrees/:name`.
pub async fn get_worktree(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<Worktree>, ApiError> {
    validate_name(&name)?;
    let worktrees = state.lifecycle.list().await?;
    worktrees
        .into_iter()
        .find(|w| w.name == name)
        .map(Json)
        .ok_or_else(|| ApiError(VibetreesError::not_found(format!("no such worktree: {name}"))))
}

/// `POST /api/worktrees`: runs the staleness preflight (§6, §8 scenario 4)
/// against the root worktree before handing off to [`crate::lifecycle::WorktreeLifecycle::create`].
pub async fn create_worktree(
    State(state): State<AppState>,
    Json(req): Json<CreateWorktreeRequest>,
) -> Result<(StatusCode, Json<CreateWorktreeResponse>), Response> {
    InputValidator::branch_name(&req.branch_name)
        .map_err(|e| ApiError(VibetreesError::validation(e.to_string())).into_response())?;
    InputValidator::branch_name(&req.from_branch)
        .map_err(|e| ApiError(VibetreesError::validation(e.to_string())).into_response())?;

    if !req.force {
        let root_path = crate::utils::paths::worktree_path(&state.config.project_root, ROOT_WORKTREE_NAME);
        let fetch = state
            .git
            .fetch_upstream(&root_path, &state.config.base_branch)
            .await
            .map_err(|e| ApiError(VibetreesError::external(e.to_string())).into_response())?;
        if fetch.has_updates {
            let has_dirty_state = state.git.has_uncommitted_changes(&root_path).await.unwrap_or(false);
            let body = NeedsSyncBody {
                needs_sync: true,
                commits_behind: fetch.commit_count,
                has_dirty_state,
                message: format!(
                    "{} is {} commits behind origin/{}",
                    ROOT_WORKTREE_NAME, fetch.commit_count, state.config.base_branch
                ),
            };
            return Err((StatusCode::CONFLICT, Json(body)).into_response());
        }
    }

    let outcome = state.lifecycle.create(&req.branch_name, &req.from_branch, req.force).await;
    if !outcome.success {
        let message = outcome.error.unwrap_or_else(|| "worktree creation failed".to_owned());
        return Err(ApiError(VibetreesError::external(message)).into_response());
    }
    Ok((StatusCode::CREATED, Json(CreateWorktreeResponse { existed: outcome.existed, worktree: outcome.worktree })))
}

/// `DELETE /api/worktrees/:name`.
pub async fn delete_worktree(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    validate_name(&name)?;
    state.lifecycle.delete(&name).await?;
    state.pty.close_all_for_worktree(&name).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/worktrees/:name/close-info`.
pub async fn close_info(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<CloseInfo>, ApiError> {
    validate_name(&name)?;
    Ok(Json(state.lifecycle.close_info(&name).await?))
}

/// `GET /api/worktrees/:name/conflicts`.
pub async fn conflicts(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<Vec<String>>, ApiError> {
    validate_name(&name)?;
    Ok(Json(state.lifecycle.conflicts(&name).await?))
}

/// `GET /api/worktrees/:name/updates`.
pub async fn fetch_updates(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<crate::git::FetchResult>, ApiError> {
    validate_name(&name)?;
    let path = crate::utils::paths::worktree_path(&state.config.project_root, &name);
    let result = state
        .git
        .fetch_upstream(&path, &state.config.base_branch)
        .await
        .map_err(|e| VibetreesError::external(e.to_string()))?;
    Ok(Json(result))
}

/// `POST /api/worktrees/:name/sync`.
pub async fn sync_worktree(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncOutcome>, ApiError> {
    validate_name(&name)?;
    let path = crate::utils::paths::worktree_path(&state.config.project_root, &name);
    let outcome = state.sync.sync_with_main(&path, &state.config.base_branch, req.strategy, req.force).await;
    Ok(Json(outcome))
}

/// `POST /api/worktrees/:name/rollback`.
pub async fn rollback_worktree(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> Result<StatusCode, ApiError> {
    validate_name(&name)?;
    let path = crate::utils::paths::worktree_path(&state.config.project_root, &name);
    state.sync.rollback(&path, &req.sha).await.map_err(|e| VibetreesError::external(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/worktrees/:name/start`.
pub async fn start_services(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StartServicesResponse>, ApiError> {
    validate_name(&name)?;
    let ports = state.lifecycle.start_services(&name).await?;
    Ok(Json(StartServicesResponse { ports }))
}

/// `POST /api/worktrees/:name/stop`.
pub async fn stop_services(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    validate_name(&name)?;
    state.lifecycle.stop_services(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/worktrees/:name/services/restart`: restarts every service in
/// the project, as distinct from the single-service variant below.
pub async fn restart_all_services(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    validate_name(&name)?;
    state.lifecycle.restart_service(&name, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/worktrees/:name/services/:service/restart`.
pub async fn restart_service(
    State(state): State<AppState>,
    Path((name, service)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    validate_name(&name)?;
    InputValidator::service_name(&service).map_err(|e| VibetreesError::validation(e.to_string()))?;
    state.lifecycle.restart_service(&name, Some(&service)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/worktrees/:name/services/:service/rebuild`.
pub async fn rebuild_service(
    State(state): State<AppState>,
    Path((name, service)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    validate_name(&name)?;
    InputValidator::service_name(&service).map_err(|e| VibetreesError::validation(e.to_string()))?;
    state.lifecycle.rebuild_service(&name, &service).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/compose/services`.
pub async fn compose_services(
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::compose::ComposeService>>, ApiError> {
    let services = state.compose.services(&state.config.compose_file).await.map_err(|e| VibetreesError::external(e.to_string()))?;
    Ok(Json(services))
}

/// `GET /api/diagnostics`.
pub async fn run_diagnostics(
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::diagnostics::Finding>>, ApiError> {
    Ok(Json(state.diagnostics.run_all(&state.config).await))
}

/// `POST /api/diagnostics/:id/fix`.
pub async fn fix_diagnostic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AutoFixOutcome>, ApiError> {
    Ok(Json(state.diagnostics.auto_fix(&id, &state.config).await?))
}

/// `GET /api/import/candidates`.
pub async fn import_candidates(
    State(state): State<AppState>,
) -> Result<Json<Vec<ImportCandidate>>, ApiError> {
    Ok(Json(state.importer.scan(&state.config).await?))
}

/// `POST /api/import`.
pub async fn import_worktree(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> Result<Json<Worktree>, ApiError> {
    Ok(Json(state.importer.import(&req.name, &state.config, &state.lifecycle).await?))
}
