//! Target database sessions.
//!
//! The engine never talks to a driver directly. It drives a [`Session`]
//! (statements and transactions) that also implements
//! [`HistoryStore`](crate::history::HistoryStore), so ledger writes share the
//! transaction of the scripts they describe.

use std::fmt;
use std::path::PathBuf;

use crate::history::memory::{MemoryServer, MemorySession};
use crate::history::sqlite::SqliteSession;
use crate::history::HistoryStore;
use crate::lock::LockStrategy;
use crate::migrations::{MigrationError, MigrationResult};

/// Backing platform of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Sqlite,
    Memory,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Sqlite => "sqlite",
            Platform::Memory => "memory",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open connection to the target database
pub trait Session {
    fn platform(&self) -> Platform;

    fn begin(&mut self) -> MigrationResult<()>;

    fn commit(&mut self) -> MigrationResult<()>;

    fn rollback(&mut self) -> MigrationResult<()>;

    fn in_transaction(&self) -> bool;

    /// Execute one or more statements
    fn execute(&mut self, sql: &str) -> MigrationResult<()>;

    /// Locking primitive this platform offers
    fn lock_strategy(&self) -> LockStrategy;
}

/// A session that also stores the history ledger
pub trait Backend: Session + HistoryStore {
    fn as_session_mut(&mut self) -> &mut dyn Session;
}

impl<T: Session + HistoryStore> Backend for T {
    fn as_session_mut(&mut self) -> &mut dyn Session {
        self
    }
}

/// Parsed data source name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dsn {
    /// `sqlite://<path>`
    SqliteFile(PathBuf),
    /// `sqlite::memory:`
    SqliteMemory,
    /// `memory://<name>`
    Memory(String),
}

impl Dsn {
    pub fn parse(raw: &str) -> MigrationResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MigrationError::validation("dsn", "cannot be empty"));
        }
        if raw == "sqlite::memory:" {
            return Ok(Dsn::SqliteMemory);
        }

        let (scheme, rest) = raw.split_once("://").ok_or_else(|| {
            MigrationError::validation("dsn", format!("'{}' is missing a scheme", raw))
        })?;

        match scheme.to_ascii_lowercase().as_str() {
            "sqlite" => {
                if rest.is_empty() {
                    return Err(MigrationError::validation("dsn", "sqlite DSN needs a path"));
                }
                Ok(Dsn::SqliteFile(PathBuf::from(rest)))
            }
            "memory" => Ok(Dsn::Memory(rest.to_string())),
            other => Err(MigrationError::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Dsn::SqliteFile(_) | Dsn::SqliteMemory => Platform::Sqlite,
            Dsn::Memory(_) => Platform::Memory,
        }
    }
}

/// Open a session for `dsn`
///
/// Relative SQLite paths resolve against `base_dir`.
pub fn connect(dsn: &str, base_dir: &std::path::Path) -> MigrationResult<Box<dyn Backend>> {
    match Dsn::parse(dsn)? {
        Dsn::SqliteFile(path) => {
            let path = if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            };
            Ok(Box::new(SqliteSession::open(&path)?))
        }
        Dsn::SqliteMemory => Ok(Box::new(SqliteSession::open_in_memory()?)),
        Dsn::Memory(_) => Ok(Box::new(MemorySession::connect(&MemoryServer::new()))),
    }
}
