//! [`axum::response::IntoResponse`] for [`VibetreesError`], converting the
//! stable error taxonomy (§7) into an HTTP status and JSON body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{ErrorBody, VibetreesError};
use crate::validate::SecretSanitizer;

/// Wraps [`VibetreesError`] so it can be returned directly from a handler as
/// `Result<T, ApiError>`.
#[derive(Debug)]
pub struct ApiError(pub VibetreesError);

impl From<VibetreesError> for ApiError {
    fn from(err: VibetreesError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(VibetreesError::from_anyhow(&err, |s| s.to_owned()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Sanitization happens exactly once, here, at the boundary before
        // the message leaves the core (§7); call sites upstream are free to
        // pass through raw anyhow/git/runtime text without redacting it
        // themselves. A throwaway sanitizer is enough for this: the pattern
        // set is stateless, and the per-process detection ring lives on
        // `AppState::sanitizer` for the happy-path (stdout/log) callers that
        // already hold a handle to it.
        let sanitized = SecretSanitizer::default().sanitize(&self.0.message).text;
        let status = StatusCode::from_u16(self.0.kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody { message: sanitized, ..(&self.0).into() };
        (status, Json(body)).into_response()
    }
}
