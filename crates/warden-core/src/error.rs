use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while spawning a child process.
///
/// These happen before the OS process exists. Once a spawn has succeeded,
/// failures travel through the supervisor's event stream instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid working directory: {0}")]
    InvalidWorkingDir(PathBuf),

    #[error("spawn failed: {0}")]
    Io(String),
}

/// Typed errors returned by the control interface.
///
/// Every variant carries a short stable code (for front-ends and logs), a
/// human message via `Display`, and an optional hint.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("workload not found: {0}")]
    NotFound(String),

    #[error("name '{0}' is already in use")]
    NameConflict(String),

    #[error("invalid argv: {0}")]
    InvalidArgv(String),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("invalid schedule expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("workload is already active")]
    AlreadyActive,

    #[error("workload is already stopped")]
    AlreadyStopped,

    #[error("workload is settling between states")]
    TransientState,

    #[error("workload is running")]
    Busy,

    #[error("timed out waiting for the supervisor to respond")]
    Timeout,

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("subscriber lagged; {missed} events were dropped")]
    SubscriberLagged { missed: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Returns a short stable code (snake_case) for wire encodings and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::NotFound(_) => "not_found",
            ControlError::NameConflict(_) => "name_conflict",
            ControlError::InvalidArgv(_) => "invalid_argv",
            ControlError::InvalidField { .. } => "invalid_field",
            ControlError::InvalidExpression { .. } => "invalid_expression",
            ControlError::InvalidPolicy(_) => "invalid_policy",
            ControlError::UnknownPolicy(_) => "unknown_policy",
            ControlError::AlreadyActive => "already_active",
            ControlError::AlreadyStopped => "already_stopped",
            ControlError::TransientState => "transient_state",
            ControlError::Busy => "busy",
            ControlError::Timeout => "timeout",
            ControlError::Spawn(_) => "spawn_error",
            ControlError::StoreUnavailable(_) => "store_unavailable",
            ControlError::SubscriberLagged { .. } => "subscriber_lagged",
            ControlError::Internal(_) => "internal",
        }
    }

    /// Optional remediation hint for front-ends.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ControlError::TransientState => {
                Some("retry after the workload settles into a stable state")
            }
            ControlError::Busy => Some("pass force=true to override"),
            ControlError::Timeout => {
                Some("the command may still complete; idempotent retries are safe")
            }
            ControlError::SubscriberLagged { .. } => {
                Some("re-subscribe and re-sync from a fresh snapshot")
            }
            _ => None,
        }
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        ControlError::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable_snake_case() {
        let errors = [
            ControlError::NotFound("x".into()),
            ControlError::NameConflict("x".into()),
            ControlError::AlreadyActive,
            ControlError::TransientState,
            ControlError::Timeout,
            ControlError::Spawn(SpawnError::ExecutableNotFound("x".into())),
        ];
        for err in errors {
            let code = err.code();
            assert!(!code.is_empty());
            assert!(code
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn test_hints_only_where_actionable() {
        assert!(ControlError::Busy.hint().is_some());
        assert!(ControlError::NotFound("x".into()).hint().is_none());
    }
}
