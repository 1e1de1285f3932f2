//! CLI error type
//!
//! Every failure leaves the process with exit code 1. The kind string is
//! the stable code of the underlying error.

use thiserror::Error;

use crate::migrations::{ErrorDetails, MigrationError};

/// CLI error
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Arguments clap accepted but that make no sense together
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// stdout or stderr could not be written
    #[error("Failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

impl CliError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    /// Stable error kind
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Migration(e) => e.code(),
            CliError::InvalidArguments(_) => "INVALID_ARGUMENTS",
            CliError::Output(_) => "OUTPUT_ERROR",
        }
    }

    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Structured detail, shown with `--verbose`
    #[track_caller]
    pub fn details(&self) -> Option<ErrorDetails> {
        match self {
            CliError::Migration(e) => Some(ErrorDetails::capture(e)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err = CliError::from(MigrationError::DuplicateTag("v1".to_string()));
        assert_eq!(err.code(), MigrationError::DuplicateTag("v1".to_string()).code());
        assert_eq!(err.to_string(), "Deployment tag 'v1' already exists");
        assert_eq!(err.exit_code(), 1);
        assert!(err.details().is_some());

        let err = CliError::invalid_arguments("--count must be positive");
        assert_eq!(err.code(), "INVALID_ARGUMENTS");
        assert!(err.details().is_none());
    }
}
