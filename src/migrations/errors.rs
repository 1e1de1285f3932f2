//! # Migration Errors
//!
//! Every failure the engine can surface, with a stable kind code that is
//! persisted alongside a failed deployment.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::io;
use std::panic::Location;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Maximum number of trace lines kept in persisted error details
const MAX_TRACE_LINES: usize = 24;

/// Why a recorded change no longer matches its script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftReason {
    /// Latest change has the `once` policy
    OnceChanged,
    /// Latest change was rolled back
    RollbackedChanged,
}

impl DriftReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftReason::OnceChanged => "once migration no longer matches history",
            DriftReason::RollbackedChanged => "rollbacked migration no longer matches history",
        }
    }
}

impl std::fmt::Display for DriftReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Migration error types
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Malformed input value (identifier, DSN, option combination)
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Project configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// File could not be read or written
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Migration or config file failed to parse
    #[error("Failed to parse {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Checksum no longer matches the history for a policy that forbids change
    #[error("Drift detected for '{location}': {reason} (recorded {recorded}, current {current})")]
    Drift {
        location: String,
        reason: DriftReason,
        recorded: String,
        current: String,
        origin: ErrorOrigin,
    },

    /// Script was edited after the change being rolled back was recorded
    #[error("Script '{location}' changed since last migrated (recorded {recorded}, current {current})")]
    ScriptChanged {
        location: String,
        recorded: String,
        current: String,
        origin: ErrorOrigin,
    },

    /// A change refers to a location the migration store no longer has
    #[error("Migration '{location}' not found in the migration store")]
    ScriptMissing { location: String },

    /// Rollback requested for a migration without a rollback script
    #[error("Migration '{location}' has no rollback script")]
    NotReversible { location: String },

    /// Explicit rollback of a location that has no history
    #[error("No history recorded for '{location}'")]
    NoHistory { location: String },

    /// Script execution failed against the target session
    #[error("Migration '{location}' failed: {message}")]
    ScriptFailed {
        location: String,
        message: String,
        origin: ErrorOrigin,
    },

    /// The target session rejected a statement
    #[error("Statement failed: {message}")]
    StatementFailed { message: String, origin: ErrorOrigin },

    /// Ordinary lock timeout
    #[error("Could not acquire deployment lock '{name}' within {timeout_ms}ms")]
    LockTimeout { name: String, timeout_ms: u64 },

    /// Lock primitive failed (not a timeout)
    #[error("Lock '{name}' failed: {message}")]
    Lock { name: String, message: String },

    /// Begin, commit or rollback failed
    #[error("Transaction {action} failed: {message}")]
    Transaction {
        action: &'static str,
        message: String,
    },

    /// Some, but not all, of the ledger tables exist
    #[error(
        "History ledger '{schema}' is corrupted: found tables [{}] but missing [{}]",
        .present.join(", "),
        .missing.join(", ")
    )]
    LedgerCorrupted {
        schema: String,
        present: Vec<String>,
        missing: Vec<String>,
    },

    /// Ledger written by a newer engine
    #[error("History ledger '{schema}' has schema version {found}, newer than supported version {supported}")]
    LedgerVersionAhead {
        schema: String,
        found: u32,
        supported: u32,
    },

    /// Ledger written by an older engine
    #[error("History ledger '{schema}' has schema version {found}, older than required version {supported}")]
    LedgerVersionBehind {
        schema: String,
        found: u32,
        supported: u32,
    },

    /// Ledger read or write failed
    #[error("History ledger error: {0}")]
    Ledger(String),

    /// Deployment tag already used
    #[error("Deployment tag '{0}' already exists")]
    DuplicateTag(String),

    /// Deployment tag unknown
    #[error("Deployment '{0}' not found")]
    DeploymentNotFound(String),

    /// Deployment was never closed, so it has no end time
    #[error("Deployment '{0}' was never closed")]
    DeploymentNotClosed(String),

    /// Hook configured with abort-on-error returned a failure
    #[error("Hook '{hook}' failed on {event}: {message}")]
    HookFailed {
        event: String,
        hook: String,
        message: String,
    },

    /// Interrupt requested between two steps
    #[error("Deployment interrupted")]
    Interrupted,

    /// Target platform or DSN scheme without a session implementation
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// SQLite session error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrationError {
    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error bound to a path
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a ledger error
    pub fn ledger(message: impl Into<String>) -> Self {
        Self::Ledger(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Script failure raised at the caller
    #[track_caller]
    pub fn script_failed(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScriptFailed {
            location: location.into(),
            message: message.into(),
            origin: ErrorOrigin::here(),
        }
    }

    /// Statement rejected by the session, raised at the caller
    #[track_caller]
    pub fn statement_failed(message: impl Into<String>) -> Self {
        Self::StatementFailed {
            message: message.into(),
            origin: ErrorOrigin::here(),
        }
    }

    #[track_caller]
    pub fn drift(
        location: impl Into<String>,
        reason: DriftReason,
        recorded: impl Into<String>,
        current: impl Into<String>,
    ) -> Self {
        Self::Drift {
            location: location.into(),
            reason,
            recorded: recorded.into(),
            current: current.into(),
            origin: ErrorOrigin::here(),
        }
    }

    #[track_caller]
    pub fn script_changed(
        location: impl Into<String>,
        recorded: impl Into<String>,
        current: impl Into<String>,
    ) -> Self {
        Self::ScriptChanged {
            location: location.into(),
            recorded: recorded.into(),
            current: current.into(),
            origin: ErrorOrigin::here(),
        }
    }

    /// Where the error was raised, for variants that record it
    pub fn origin(&self) -> Option<&ErrorOrigin> {
        match self {
            Self::Drift { origin, .. }
            | Self::ScriptChanged { origin, .. }
            | Self::ScriptFailed { origin, .. }
            | Self::StatementFailed { origin, .. } => Some(origin),
            _ => None,
        }
    }

    /// Stable kind code, persisted as the deployment error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Io { .. } => "IO",
            Self::Parse { .. } => "PARSE",
            Self::Drift { .. } => "DRIFT",
            Self::ScriptChanged { .. } => "SCRIPT_CHANGED",
            Self::ScriptMissing { .. } => "SCRIPT_MISSING",
            Self::NotReversible { .. } => "NOT_REVERSIBLE",
            Self::NoHistory { .. } => "NO_HISTORY",
            Self::ScriptFailed { .. } => "SCRIPT_FAILED",
            Self::StatementFailed { .. } => "STATEMENT_FAILED",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Lock { .. } => "LOCK",
            Self::Transaction { .. } => "TRANSACTION",
            Self::LedgerCorrupted { .. } => "LEDGER_CORRUPTED",
            Self::LedgerVersionAhead { .. } | Self::LedgerVersionBehind { .. } => {
                "LEDGER_VERSION_MISMATCH"
            }
            Self::Ledger(_) => "LEDGER",
            Self::DuplicateTag(_) => "DUPLICATE_TAG",
            Self::DeploymentNotFound(_) => "DEPLOYMENT_NOT_FOUND",
            Self::DeploymentNotClosed(_) => "DEPLOYMENT_NOT_CLOSED",
            Self::HookFailed { .. } => "HOOK_FAILED",
            Self::Interrupted => "INTERRUPTED",
            Self::UnsupportedPlatform(_) => "UNSUPPORTED_PLATFORM",
            Self::Sqlite(_) => "SQLITE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the failure is a checksum consistency error
    pub fn is_drift(&self) -> bool {
        matches!(self, Self::Drift { .. } | Self::ScriptChanged { .. })
    }
}

impl From<serde_yaml::Error> for MigrationError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Source position and crate frames recorded when an error is raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorOrigin {
    file: &'static str,
    line: u32,
    frames: Vec<String>,
}

impl ErrorOrigin {
    /// Origin at the caller
    #[track_caller]
    pub fn here() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            frames: crate_frames(&Backtrace::capture()),
        }
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }
}

/// Backtrace lines that belong to this crate
fn crate_frames(backtrace: &Backtrace) -> Vec<String> {
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    backtrace
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|line| line.contains(env!("CARGO_PKG_NAME")))
        .take(MAX_TRACE_LINES)
        .map(str::to_string)
        .collect()
}

/// Structured failure detail stored on a closed deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    pub kind: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    #[serde(default)]
    pub trace: Vec<String>,
}

impl ErrorDetails {
    /// Capture details for `err`. The origin recorded when the error was
    /// raised wins; otherwise the caller is used.
    #[track_caller]
    pub fn capture(err: &MigrationError) -> Self {
        let origin = match err.origin() {
            Some(origin) => origin.clone(),
            None => ErrorOrigin::here(),
        };

        let mut trace = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            trace.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        trace.extend(origin.frames);
        trace.truncate(MAX_TRACE_LINES);

        Self {
            message: err.to_string(),
            kind: err.code().to_string(),
            file: Some(origin.file.to_string()),
            line: Some(origin.line),
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_message() {
        let err = MigrationError::drift("a.yaml", DriftReason::OnceChanged, "sha256:aa", "sha256:bb");

        let msg = err.to_string();
        assert!(msg.contains("a.yaml"));
        assert!(msg.contains("once migration no longer matches history"));
        assert!(err.is_drift());
        assert_eq!(err.code(), "DRIFT");
    }

    #[test]
    fn test_lock_timeout_message() {
        let err = MigrationError::LockTimeout {
            name: "migrata".to_string(),
            timeout_ms: 250,
        };
        assert!(err.to_string().contains("Could not acquire deployment lock"));
    }

    #[test]
    fn test_corruption_lists_tables() {
        let err = MigrationError::LedgerCorrupted {
            schema: "hist".to_string(),
            present: vec!["hist_change".to_string()],
            missing: vec!["hist_deployment".to_string(), "hist_version".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("hist_change"));
        assert!(msg.contains("hist_deployment, hist_version"));
    }

    #[test]
    fn test_error_details_capture() {
        let err = MigrationError::io(
            "migrations/a.yaml",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        let details = ErrorDetails::capture(&err);

        assert_eq!(details.kind, "IO");
        assert!(details.file.as_deref().unwrap().ends_with("errors.rs"));
        assert!(details.line.is_some());
        assert_eq!(details.trace[0], "caused by: gone");
    }

    #[test]
    fn test_error_details_keep_origin() {
        let (err, raised_at) = (MigrationError::script_failed("a.sql", "syntax error"), line!());
        let details = ErrorDetails::capture(&err);

        assert_eq!(details.kind, "SCRIPT_FAILED");
        assert_eq!(details.line, Some(raised_at));
        assert_eq!(err.origin().map(ErrorOrigin::line), Some(raised_at));
    }
}
