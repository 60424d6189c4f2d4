//! Stable error taxonomy exposed at the external boundary (§7), built on top
//! of the `anyhow` breadcrumb trail used internally.

use serde::Serialize;
use thiserror::Error;

/// The stable, machine-readable error kind surfaced over HTTP/WS (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input rejected by the validator; recoverable by fixing the input.
    Validation,
    /// Worktree, service, or session missing.
    NotFound,
    /// Git merge conflicts, or main-branch staleness during create.
    Conflict,
    /// Port space exhausted.
    Exhaustion,
    /// Failure of git, the container runtime, or the dependency installer.
    External,
    /// A step deadline was exceeded.
    Timeout,
    /// An idempotency probe found an incoherent state auto-repair could not
    /// resolve.
    State,
    /// Programmer error; never expected in normal operation.
    Internal,
}

/// The error type returned across the external boundary (component E).
/// Internal code propagates `anyhow::Result`; this type is constructed only
/// when a result crosses into an HTTP/WS response.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct VibetreesError {
    /// The stable kind.
    pub kind: ErrorKind,
    /// Sanitized, human-readable message.
    pub message: String,
    /// Step name, when this error originated inside a pipeline.
    pub step: Option<String>,
}

impl VibetreesError {
    /// Construct directly with a kind and message.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step: None,
        }
    }

    /// Attach the pipeline step name this error occurred in.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// `Validation` constructor.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// `NotFound` constructor.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// `Conflict` constructor.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// `Exhaustion` constructor.
    #[must_use]
    pub fn exhaustion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exhaustion, message)
    }

    /// `External` constructor, wrapping a sanitized stderr/output string.
    #[must_use]
    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::External, message)
    }

    /// `Timeout` constructor.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// `State` constructor.
    #[must_use]
    pub fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message)
    }

    /// `Internal` constructor; should not normally be reachable.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Maps an `anyhow::Error` crossing the boundary into an `Internal`
    /// error, sanitizing its text first. Call sites that know the precise
    /// kind should use the typed constructors instead; this is the fallback
    /// for errors that bubble up without classification.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error, sanitize: impl Fn(&str) -> String) -> Self {
        Self::internal(sanitize(&format!("{err:#}")))
    }
}

/// Wire-serializable form of [`VibetreesError`] for HTTP/WS responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// The stable kind.
    pub kind: ErrorKind,
    /// Sanitized message.
    pub message: String,
    /// Step name, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl From<&VibetreesError> for ErrorBody {
    fn from(e: &VibetreesError) -> Self {
        Self {
            kind: e.kind,
            message: e.message.clone(),
            step: e.step.clone(),
        }
    }
}

impl ErrorKind {
    /// The HTTP status code this kind maps to.
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Exhaustion => 507,
            ErrorKind::Timeout => 504,
            ErrorKind::External | ErrorKind::State => 502,
            ErrorKind::Internal => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
    }

    #[test]
    fn with_step_attaches_step_name() {
        let e = VibetreesError::external("git failed").with_step("git_worktree_add");
        assert_eq!(e.step.as_deref(), Some("git_worktree_add"));
    }
}
