//! Ledger schema version checks.
//!
//! A ledger is either fully installed with a compatible version, or not
//! installed at all. Anything in between refuses to proceed:
//!
//! - some ledger tables exist but not all: partial installation
//! - version newer than this binary understands: downgrade
//! - version older than this binary requires: upgrade needed

use tracing::error;

use super::{HistoryStore, LedgerTable};
use crate::migrations::{MigrationError, MigrationResult};

/// Ledger layout version written by this binary
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

/// Result of inspecting a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    /// No ledger table exists
    Missing,
    /// All tables exist with a compatible version
    Ready,
}

/// Inspect the ledger for `schema`
pub fn inspect<S: HistoryStore + ?Sized>(store: &S, schema: &str) -> MigrationResult<LedgerState> {
    let present = store.ledger_tables(schema)?;
    if present.is_empty() {
        return Ok(LedgerState::Missing);
    }

    let missing: Vec<LedgerTable> = LedgerTable::ALL
        .iter()
        .copied()
        .filter(|table| !present.contains(table))
        .collect();
    if !missing.is_empty() {
        let err = MigrationError::LedgerCorrupted {
            schema: schema.to_string(),
            present: present.iter().map(|t| t.table_name(schema)).collect(),
            missing: missing.iter().map(|t| t.table_name(schema)).collect(),
        };
        error!(schema, error = %err, "partial ledger installation");
        return Err(err);
    }

    let found = store.ledger_version(schema)?.ok_or_else(|| {
        MigrationError::ledger(format!(
            "version table {} is empty",
            LedgerTable::Version.table_name(schema)
        ))
    })?;
    check_version(schema, found)?;
    Ok(LedgerState::Ready)
}

/// Compare a recorded ledger version with the supported one
pub fn check_version(schema: &str, found: u32) -> MigrationResult<()> {
    if found > LEDGER_SCHEMA_VERSION {
        return Err(MigrationError::LedgerVersionAhead {
            schema: schema.to_string(),
            found,
            supported: LEDGER_SCHEMA_VERSION,
        });
    }
    if found < LEDGER_SCHEMA_VERSION {
        return Err(MigrationError::LedgerVersionBehind {
            schema: schema.to_string(),
            found,
            supported: LEDGER_SCHEMA_VERSION,
        });
    }
    Ok(())
}
