//! The trust boundary (§4.V) applied to every user-originated string before
//! it drives git, the container runtime, or a filesystem path, and to every
//! outbound string before it leaves the core (see [`sanitize`]).

pub mod sanitize;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

pub use sanitize::SecretSanitizer;

/// Reasons the validator rejects an input; one arm per row of the table in
/// §4.V, kept as a distinct enum rather than reusing `ErrorKind` so callers
/// can surface the specific rule violated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("worktree name must match ^[A-Za-z0-9_-]+$, be 1-255 chars, and not be a reserved name")]
    WorktreeName,
    #[error("branch name must match ^[A-Za-z0-9/_.-]+$ with no leading/trailing '/', no '..', no '//', no trailing '.lock'")]
    BranchName,
    #[error("path escapes the allowed base, or contains a null byte")]
    Path,
    #[error("service name must match ^[A-Za-z0-9_-]+$ and be at most 100 chars")]
    ServiceName,
    #[error("port must be an integer in 1024..=65535")]
    Port,
    #[error("env var name must match ^[A-Z_][A-Z0-9_]*$")]
    EnvVarName,
    #[error("env var value exceeds 10000 chars or contains a null byte")]
    EnvVarValue,
    #[error("executable is not in the allowlist")]
    Executable,
    #[error("git argument contains a shell metacharacter or control character")]
    GitArg,
    #[error("compose subcommand is not in the allowlist, or contains a shell metacharacter")]
    ComposeSubcommand,
    #[error("websocket url contains '..' or exceeds 1000 chars")]
    WebSocketUrl,
    #[error("regex pattern has a ReDoS-prone shape")]
    RedosShape,
}

fn worktree_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"))
}

fn branch_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9/_.-]+$").expect("valid regex"))
}

fn service_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"))
}

fn env_var_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("valid regex"))
}

fn shell_metachar_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r";|&&|\|\||\||`|\$\(|\$\{|\n").expect("valid regex"))
}

const RESERVED_WORKTREE_NAMES: &[&str] = &[
    ".", "..", "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
    "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const COMPOSE_SUBCOMMAND_ALLOWLIST: &[&str] = &[
    "up", "down", "ps", "logs", "stop", "start", "restart", "config", "version", "pull", "build",
];

/// Stateless validator for every user-originated string the core accepts.
/// All methods are precondition checks: they fail fast with a descriptive
/// [`ValidationError`] rather than attempting to coerce the input.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputValidator;

impl InputValidator {
    /// Validates a worktree name.
    ///
    /// # Errors
    /// Returns [`ValidationError::WorktreeName`] if the name is empty, over
    /// 255 chars, contains a character outside `[A-Za-z0-9_-]`, or is a
    /// reserved name.
    pub fn worktree_name(name: &str) -> Result<(), ValidationError> {
        if name.is_empty() || name.len() > 255 || !worktree_name_re().is_match(name) {
            return Err(ValidationError::WorktreeName);
        }
        let upper = name.to_uppercase();
        if RESERVED_WORKTREE_NAMES.contains(&upper.as_str()) || RESERVED_WORKTREE_NAMES.contains(&name) {
            return Err(ValidationError::WorktreeName);
        }
        Ok(())
    }

    /// Validates a branch name.
    ///
    /// # Errors
    /// Returns [`ValidationError::BranchName`] if the name is empty,
    /// contains a character outside `[A-Za-z0-9/_.-]`, starts or ends with
    /// `/`, contains `..` or `//`, or ends with `.lock`.
    pub fn branch_name(name: &str) -> Result<(), ValidationError> {
        if name.is_empty() || !branch_name_re().is_match(name) {
            return Err(ValidationError::BranchName);
        }
        if name.starts_with('/') || name.ends_with('/') {
            return Err(ValidationError::BranchName);
        }
        if name.contains("..") || name.contains("//") {
            return Err(ValidationError::BranchName);
        }
        if name.ends_with(".lock") {
            return Err(ValidationError::BranchName);
        }
        Ok(())
    }

    /// Validates that `candidate`, once normalized and resolved against
    /// `base`, stays within `base`, and contains no null bytes.
    ///
    /// # Errors
    /// Returns [`ValidationError::Path`] on traversal outside `base` or a
    /// null byte.
    pub fn path(candidate: &Path, base: &Path) -> Result<PathBuf, ValidationError> {
        if candidate.to_string_lossy().contains('\0') {
            return Err(ValidationError::Path);
        }
        crate::utils::directory::resolve_within(base, candidate).ok_or(ValidationError::Path)
    }

    /// Validates a compose service name.
    ///
    /// # Errors
    /// Returns [`ValidationError::ServiceName`] if empty, over 100 chars, or
    /// containing a character outside `[A-Za-z0-9_-]`.
    pub fn service_name(name: &str) -> Result<(), ValidationError> {
        if name.is_empty() || name.len() > 100 || !service_name_re().is_match(name) {
            return Err(ValidationError::ServiceName);
        }
        Ok(())
    }

    /// Validates a port number is in the user-assignable range.
    ///
    /// # Errors
    /// Returns [`ValidationError::Port`] if outside `1024..=65535`.
    pub fn port(port: u32) -> Result<u16, ValidationError> {
        if !(1024..=65535).contains(&port) {
            return Err(ValidationError::Port);
        }
        Ok(port as u16)
    }

    /// Validates an env-var name.
    ///
    /// # Errors
    /// Returns [`ValidationError::EnvVarName`] if it doesn't match
    /// `^[A-Z_][A-Z0-9_]*$`.
    pub fn env_var_name(name: &str) -> Result<(), ValidationError> {
        if !env_var_name_re().is_match(name) {
            return Err(ValidationError::EnvVarName);
        }
        Ok(())
    }

    /// Validates an env-var value. Shell metacharacters are allowed but
    /// logged as a warning by the caller; only length and null bytes are
    /// hard failures.
    ///
    /// # Errors
    /// Returns [`ValidationError::EnvVarValue`] if over 10,000 chars or
    /// containing a null byte.
    pub fn env_var_value(value: &str) -> Result<(), ValidationError> {
        if value.len() > 10_000 || value.contains('\0') {
            return Err(ValidationError::EnvVarValue);
        }
        Ok(())
    }

    /// True if `value` contains a shell metacharacter worth warning about,
    /// even though [`Self::env_var_value`] itself does not reject it.
    #[must_use]
    pub fn has_shell_metachars(value: &str) -> bool {
        shell_metachar_re().is_match(value)
    }

    /// Validates an executable name against a closed allowlist of PTY
    /// commands (shell + known AI assistants).
    ///
    /// # Errors
    /// Returns [`ValidationError::Executable`] if not in the allowlist.
    pub fn executable(name: &str, allowlist: &[&str]) -> Result<(), ValidationError> {
        if allowlist.contains(&name) {
            Ok(())
        } else {
            Err(ValidationError::Executable)
        }
    }

    /// Validates a single argument to be passed to `git`.
    ///
    /// # Errors
    /// Returns [`ValidationError::GitArg`] if it contains `;`, `&&`, `||`,
    /// `|`, a backtick, `$(`, `${`, a newline, or a NUL byte.
    pub fn git_arg(arg: &str) -> Result<(), ValidationError> {
        if arg.contains('\0') || shell_metachar_re().is_match(arg) {
            return Err(ValidationError::GitArg);
        }
        Ok(())
    }

    /// Validates a compose subcommand against the closed allowlist, plus the
    /// shared shell-metacharacter rejection.
    ///
    /// # Errors
    /// Returns [`ValidationError::ComposeSubcommand`] if not allowlisted or
    /// containing a shell metacharacter.
    pub fn compose_subcommand(subcommand: &str) -> Result<(), ValidationError> {
        if !COMPOSE_SUBCOMMAND_ALLOWLIST.contains(&subcommand) {
            return Err(ValidationError::ComposeSubcommand);
        }
        if shell_metachar_re().is_match(subcommand) || subcommand.contains(" | ") {
            return Err(ValidationError::ComposeSubcommand);
        }
        Ok(())
    }

    /// Validates a WebSocket request path/URL.
    ///
    /// # Errors
    /// Returns [`ValidationError::WebSocketUrl`] if it contains `..` or
    /// exceeds 1000 chars.
    pub fn websocket_url(url: &str) -> Result<(), ValidationError> {
        if url.contains("..") || url.len() > 1000 {
            return Err(ValidationError::WebSocketUrl);
        }
        Ok(())
    }

    /// Rejects regex patterns with a known ReDoS-prone shape: nested
    /// unbounded quantifiers like `(.*){3,}`, `+*`/`*+`, or a repeated lazy
    /// `.*?`. This is a defense-in-depth guard (Design Notes §9); it is not
    /// a full backtracking-complexity analyzer.
    ///
    /// # Errors
    /// Returns [`ValidationError::RedosShape`] if a known-bad shape is
    /// detected.
    pub fn regex_pattern(pattern: &str) -> Result<(), ValidationError> {
        static REDOS_SHAPES: OnceLock<Vec<Regex>> = OnceLock::new();
        let shapes = REDOS_SHAPES.get_or_init(|| {
            vec![
                Regex::new(r"\(\.\*\)\{[3-9]|\(\.\*\)\{\d{2,}").expect("valid regex"),
                Regex::new(r"\+\*|\*\+").expect("valid regex"),
                Regex::new(r"(\.\*\?){2,}").expect("valid regex"),
            ]
        });
        if shapes.iter().any(|re| re.is_match(pattern)) {
            return Err(ValidationError::RedosShape);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_name_rejects_reserved() {
        assert!(InputValidator::worktree_name(".").is_err());
        assert!(InputValidator::worktree_name("..").is_err());
        assert!(InputValidator::worktree_name("CON").is_err());
    }

    #[test]
    fn worktree_name_accepts_simple() {
        assert!(InputValidator::worktree_name("feat-login").is_ok());
    }

    #[test]
    fn branch_name_rejects_traversal_and_lock_suffix() {
        assert!(InputValidator::branch_name("feat/../x").is_err());
        assert!(InputValidator::branch_name("refs/heads/x.lock").is_err());
        assert!(InputValidator::branch_name("/leading").is_err());
        assert!(InputValidator::branch_name("trailing/").is_err());
    }

    #[test]
    fn empty_and_dot_branch_names_are_rejected() {
        assert!(InputValidator::branch_name("").is_err());
        assert!(InputValidator::worktree_name("").is_err());
    }

    #[test]
    fn path_traversal_is_rejected() {
        let base = Path::new("/project/.worktrees");
        assert!(InputValidator::path(Path::new("../etc/passwd"), base).is_err());
        assert!(InputValidator::path(Path::new("./a/../b"), base).is_ok());
    }

    #[rstest::rstest]
    #[case::simple_subdir("feat-login", true)]
    #[case::nested("feat-login/nested", true)]
    #[case::dot_resolves_inside("./a/../b", true)]
    #[case::parent_escape("../etc/passwd", false)]
    #[case::parent_escape_via_subdir("feat-login/../../etc/passwd", false)]
    #[case::absolute_outside_base("/etc/passwd", false)]
    #[case::null_byte("feat\0login", false)]
    fn path_boundary_cases(#[case] candidate: &str, #[case] should_resolve: bool) {
        let base = Path::new("/project/.worktrees");
        let result = InputValidator::path(Path::new(candidate), base);
        assert_eq!(result.is_ok(), should_resolve, "candidate {candidate:?}");
    }

    #[test]
    fn port_boundaries() {
        assert!(InputValidator::port(1023).is_err());
        assert!(InputValidator::port(1024).is_ok());
        assert!(InputValidator::port(65535).is_ok());
        assert!(InputValidator::port(65536).is_err());
    }

    #[test]
    fn git_arg_rejects_shell_injection_shapes() {
        for bad in [";", "&&", "||", "|", "`id`", "$(id)", "${HOME}", "line\nbreak"] {
            assert!(InputValidator::git_arg(bad).is_err(), "should reject {bad:?}");
        }
        assert!(InputValidator::git_arg("--force").is_ok());
    }

    #[test]
    fn compose_subcommand_allowlist() {
        assert!(InputValidator::compose_subcommand("up").is_ok());
        assert!(InputValidator::compose_subcommand("exec").is_err());
        assert!(InputValidator::compose_subcommand("up; rm -rf /").is_err());
    }

    #[test]
    fn regex_pattern_rejects_redos_shapes() {
        assert!(InputValidator::regex_pattern("(.*){3,}").is_err());
        assert!(InputValidator::regex_pattern("a+*b").is_err());
        assert!(InputValidator::regex_pattern(".*?.*?").is_err());
        assert!(InputValidator::regex_pattern("^[a-z]+$").is_ok());
    }
}
