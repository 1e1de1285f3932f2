//! Configuration Validation
//!
//! Checks a loaded project file field by field. Every problem is collected
//! before reporting, so one run shows all of them.

use std::fmt;

use crate::history::validate_schema_name;
use crate::migrations::{MigrationError, MigrationResult};
use crate::session::Dsn;

/// One rejected field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidationError {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid configuration for '{}': {} (value: {})",
            self.field, self.message, self.value
        )
    }
}

/// Builder-style validator accumulating field errors
#[derive(Debug, Default)]
pub struct ConfigValidator {
    errors: Vec<ConfigValidationError>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn error(&mut self, field: &str, value: impl fmt::Display, message: &str) {
        self.errors.push(ConfigValidationError {
            field: field.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        });
    }

    /// Validate non-empty string
    pub fn validate_non_empty(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.error(field, value, "Value cannot be empty");
        }
        self
    }

    /// Validate a name usable as a ledger table prefix
    pub fn validate_identifier(&mut self, field: &str, value: &str) -> &mut Self {
        match validate_schema_name(value) {
            Ok(()) => {}
            Err(MigrationError::Validation { message, .. }) => self.error(field, value, &message),
            Err(other) => self.error(field, value, &other.to_string()),
        }
        self
    }

    /// Validate a DSN with a supported scheme
    pub fn validate_dsn(&mut self, field: &str, value: &str) -> &mut Self {
        match Dsn::parse(value) {
            Ok(_) => {}
            Err(MigrationError::UnsupportedPlatform(scheme)) => {
                self.error(field, value, &format!("Unsupported DSN scheme '{}'", scheme));
            }
            Err(MigrationError::Validation { message, .. }) => self.error(field, value, &message),
            Err(other) => self.error(field, value, &other.to_string()),
        }
        self
    }

    /// Validate duration in milliseconds
    pub fn validate_duration_ms(&mut self, field: &str, ms: u64, min_ms: u64, max_ms: u64) -> &mut Self {
        if ms < min_ms || ms > max_ms {
            self.error(
                field,
                format!("{}ms", ms),
                &format!("Duration must be between {}ms and {}ms", min_ms, max_ms),
            );
        }
        self
    }

    /// Validate a hook command line: a program followed by arguments
    pub fn validate_command(&mut self, field: &str, command: &[String]) -> &mut Self {
        match command.first() {
            None => self.error(field, "[]", "Command cannot be empty"),
            Some(program) if program.trim().is_empty() => {
                self.error(field, program, "Program cannot be empty")
            }
            Some(_) => {}
        }
        self
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Finish validation; all collected errors become one `InvalidConfig`
    pub fn finish(self) -> MigrationResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::InvalidConfig(format_validation_errors(&self.errors)))
        }
    }
}

/// Format validation errors for display
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("\n  - {}", e))
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        let mut v = ConfigValidator::new();
        v.validate_identifier("history_schema", "migrata_history");
        assert!(v.finish().is_ok());

        let mut v = ConfigValidator::new();
        v.validate_identifier("history_schema", "1bad-name");
        assert_eq!(v.errors().len(), 1);
        assert!(v.finish().is_err());
    }

    #[test]
    fn test_dsn_validation() {
        let mut v = ConfigValidator::new();
        v.validate_dsn("dsn", "sqlite://app.db").validate_dsn("dsn", "memory://x");
        assert!(!v.has_errors());

        let mut v = ConfigValidator::new();
        v.validate_dsn("environments.prod.dsn", "postgres://db/app");
        assert!(v.errors()[0].message.contains("postgres"));
    }

    #[test]
    fn test_duration_range() {
        let mut v = ConfigValidator::new();
        v.validate_duration_ms("lock_poll_ms", 5, 10, 500);
        let errors = v.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("between"));
    }

    #[test]
    fn test_multiple_errors_reported_together() {
        let mut v = ConfigValidator::new();
        v.validate_non_empty("name", " ")
            .validate_command("hooks[0].command", &[])
            .validate_dsn("dsn", "");

        assert_eq!(v.errors().len(), 3);
        match v.finish() {
            Err(MigrationError::InvalidConfig(message)) => {
                assert!(message.contains("'name'"));
                assert!(message.contains("hooks[0].command"));
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }
}
