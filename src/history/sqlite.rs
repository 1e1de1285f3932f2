//! SQLite session and ledger storage.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{
    format_timestamp, parse_timestamp, Change, ChangeStatus, Command, Deployment, HistoryStore,
    LedgerTable,
};
use crate::lock::{AdvisoryPrimitive, LockStrategy};
use crate::migrations::{ErrorDetails, MigratePolicy, MigrationError, MigrationResult};
use crate::session::{Platform, Session};

const CHANGE_COLUMNS: &str = "location, deployment_tag, migrate_policy, status, author, checksum, \
                              description, authored_at, deployed_at";

const DEPLOYMENT_COLUMNS: &str = "tag, command, deployer, application, schema_version, started_at, \
                                  ended_at, error_details";

/// Named locks private to one in-memory database
#[derive(Debug, Default)]
struct PrivateLocks {
    held: Mutex<HashSet<String>>,
}

impl AdvisoryPrimitive for PrivateLocks {
    fn try_lock(&self, key: &str) -> MigrationResult<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| MigrationError::internal("sqlite lock table poisoned"))?;
        Ok(held.insert(key.to_string()))
    }

    fn unlock(&self, key: &str) -> MigrationResult<()> {
        self.held
            .lock()
            .map_err(|_| MigrationError::internal("sqlite lock table poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// Session over a SQLite database file or an in-memory database
pub struct SqliteSession {
    conn: Connection,
    path: Option<PathBuf>,
    private_locks: Arc<PrivateLocks>,
}

impl SqliteSession {
    pub fn open(path: &Path) -> MigrationResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| MigrationError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened sqlite session");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            private_locks: Arc::default(),
        })
    }

    pub fn open_in_memory() -> MigrationResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            path: None,
            private_locks: Arc::default(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn transaction_error(action: &'static str, err: rusqlite::Error) -> MigrationError {
        MigrationError::Transaction {
            action,
            message: err.to_string(),
        }
    }

    fn install_statements(schema: &str, version: u32, installed_at: &str) -> String {
        let deployment = LedgerTable::Deployment.table_name(schema);
        let change = LedgerTable::Change.table_name(schema);
        let version_table = LedgerTable::Version.table_name(schema);
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {deployment} (
                tag TEXT PRIMARY KEY NOT NULL,
                command TEXT NOT NULL,
                deployer TEXT NOT NULL,
                application TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                error TEXT,
                error_details TEXT
            );
            CREATE TABLE IF NOT EXISTS {change} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location TEXT NOT NULL,
                deployment_tag TEXT NOT NULL REFERENCES {deployment}(tag),
                migrate_policy TEXT NOT NULL,
                status TEXT NOT NULL,
                author TEXT NOT NULL,
                checksum TEXT NOT NULL,
                description TEXT NOT NULL,
                authored_at TEXT,
                deployed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {change}_location ON {change} (lower(location), deployed_at);
            CREATE TABLE IF NOT EXISTS {version_table} (
                version INTEGER NOT NULL,
                installed_at TEXT NOT NULL
            );
            INSERT INTO {version_table} (version, installed_at) VALUES ({version}, '{installed_at}');
            "#,
        )
    }
}

/// Raw change row before parsing enum and timestamp columns
struct ChangeRow {
    location: String,
    deployment_tag: String,
    migrate_policy: String,
    status: String,
    author: String,
    checksum: String,
    description: String,
    authored_at: Option<String>,
    deployed_at: String,
}

impl ChangeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            location: row.get(0)?,
            deployment_tag: row.get(1)?,
            migrate_policy: row.get(2)?,
            status: row.get(3)?,
            author: row.get(4)?,
            checksum: row.get(5)?,
            description: row.get(6)?,
            authored_at: row.get(7)?,
            deployed_at: row.get(8)?,
        })
    }

    fn into_change(self) -> MigrationResult<Change> {
        Ok(Change {
            location: self.location,
            deployment_tag: self.deployment_tag,
            migrate_policy: self
                .migrate_policy
                .parse::<MigratePolicy>()
                .map_err(|e| MigrationError::ledger(e.to_string()))?,
            status: self.status.parse::<ChangeStatus>()?,
            author: self.author,
            checksum: self.checksum,
            description: self.description,
            authored_at: self.authored_at.as_deref().map(parse_timestamp).transpose()?,
            deployed_at: parse_timestamp(&self.deployed_at)?,
        })
    }
}

struct DeploymentRow {
    tag: String,
    command: String,
    deployer: String,
    application: String,
    schema_version: u32,
    started_at: String,
    ended_at: Option<String>,
    error_details: Option<String>,
}

impl DeploymentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tag: row.get(0)?,
            command: row.get(1)?,
            deployer: row.get(2)?,
            application: row.get(3)?,
            schema_version: row.get(4)?,
            started_at: row.get(5)?,
            ended_at: row.get(6)?,
            error_details: row.get(7)?,
        })
    }

    fn into_deployment(self) -> MigrationResult<Deployment> {
        let error = match self.error_details {
            Some(json) => Some(
                serde_json::from_str::<ErrorDetails>(&json)
                    .map_err(|e| MigrationError::ledger(format!("invalid error details: {}", e)))?,
            ),
            None => None,
        };
        Ok(Deployment {
            tag: self.tag,
            command: self.command.parse::<Command>()?,
            deployer: self.deployer,
            application: self.application,
            schema_version: self.schema_version,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_timestamp).transpose()?,
            error,
        })
    }
}

impl Session for SqliteSession {
    fn platform(&self) -> Platform {
        Platform::Sqlite
    }

    fn begin(&mut self) -> MigrationResult<()> {
        self.conn
            .execute_batch("BEGIN")
            .map_err(|e| Self::transaction_error("begin", e))
    }

    fn commit(&mut self) -> MigrationResult<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| Self::transaction_error("commit", e))
    }

    fn rollback(&mut self) -> MigrationResult<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| Self::transaction_error("rollback", e))
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn execute(&mut self, sql: &str) -> MigrationResult<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| MigrationError::statement_failed(e.to_string()))
    }

    /// File lock next to the database; an in-memory database is private
    /// to this connection and only needs a session-local lock
    fn lock_strategy(&self) -> LockStrategy {
        match self.path.as_deref() {
            Some(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                LockStrategy::File { dir }
            }
            None => LockStrategy::Advisory(self.private_locks.clone()),
        }
    }
}

impl HistoryStore for SqliteSession {
    fn ledger_tables(&self, schema: &str) -> MigrationResult<Vec<LedgerTable>> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
        let mut present = Vec::new();
        for table in LedgerTable::ALL {
            if stmt.exists(params![table.table_name(schema)])? {
                present.push(table);
            }
        }
        Ok(present)
    }

    fn ledger_version(&self, schema: &str) -> MigrationResult<Option<u32>> {
        let sql = format!(
            "SELECT MAX(version) FROM {}",
            LedgerTable::Version.table_name(schema)
        );
        let version: Option<u32> = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(version)
    }

    fn install_ledger(
        &mut self,
        schema: &str,
        version: u32,
        installed_at: DateTime<Utc>,
    ) -> MigrationResult<()> {
        let statements = Self::install_statements(schema, version, &format_timestamp(&installed_at));
        self.conn.execute_batch("SAVEPOINT ledger_install")?;
        match self.conn.execute_batch(&statements) {
            Ok(()) => {
                self.conn.execute_batch("RELEASE ledger_install")?;
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .conn
                    .execute_batch("ROLLBACK TO ledger_install; RELEASE ledger_install");
                Err(MigrationError::ledger(format!("failed to install ledger '{}': {}", schema, e)))
            }
        }
    }

    fn insert_deployment(&mut self, schema: &str, deployment: &Deployment) -> MigrationResult<()> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)",
            LedgerTable::Deployment.table_name(schema),
            DEPLOYMENT_COLUMNS
        );
        let result = self.conn.execute(
            &sql,
            params![
                deployment.tag,
                deployment.command.as_str(),
                deployment.deployer,
                deployment.application,
                deployment.schema_version,
                format_timestamp(&deployment.started_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(MigrationError::DuplicateTag(deployment.tag.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close_deployment(
        &mut self,
        schema: &str,
        tag: &str,
        ended_at: DateTime<Utc>,
        error: Option<&ErrorDetails>,
    ) -> MigrationResult<()> {
        let table = LedgerTable::Deployment.table_name(schema);
        let details = error.map(serde_json::to_string).transpose()?;
        let sql = format!(
            "UPDATE {} SET ended_at = ?2, error = ?3, error_details = ?4 WHERE tag = ?1 AND ended_at IS NULL",
            table
        );
        let updated = self.conn.execute(
            &sql,
            params![
                tag,
                format_timestamp(&ended_at),
                error.map(|e| e.message.as_str()),
                details,
            ],
        )?;
        if updated == 1 {
            return Ok(());
        }
        match self.find_deployment(schema, tag)? {
            Some(_) => Err(MigrationError::ledger(format!("deployment '{}' is already closed", tag))),
            None => Err(MigrationError::DeploymentNotFound(tag.to_string())),
        }
    }

    fn insert_change(&mut self, schema: &str, change: &Change) -> MigrationResult<()> {
        if self.find_deployment(schema, &change.deployment_tag)?.is_none() {
            return Err(MigrationError::DeploymentNotFound(change.deployment_tag.clone()));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            LedgerTable::Change.table_name(schema),
            CHANGE_COLUMNS
        );
        self.conn.execute(
            &sql,
            params![
                change.location,
                change.deployment_tag,
                change.migrate_policy.as_str(),
                change.status.as_str(),
                change.author,
                change.checksum,
                change.description,
                change.authored_at.as_ref().map(format_timestamp),
                format_timestamp(&change.deployed_at),
            ],
        )?;
        Ok(())
    }

    fn find_deployment(&self, schema: &str, tag: &str) -> MigrationResult<Option<Deployment>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE tag = ?1",
            DEPLOYMENT_COLUMNS,
            LedgerTable::Deployment.table_name(schema)
        );
        let row = self
            .conn
            .query_row(&sql, params![tag], DeploymentRow::from_row)
            .optional()?;
        row.map(DeploymentRow::into_deployment).transpose()
    }

    fn latest_change(&self, schema: &str, location: &str) -> MigrationResult<Option<Change>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE lower(location) = lower(?1) ORDER BY deployed_at DESC, id DESC LIMIT 1",
            CHANGE_COLUMNS,
            LedgerTable::Change.table_name(schema)
        );
        let row = self
            .conn
            .query_row(&sql, params![location], ChangeRow::from_row)
            .optional()?;
        row.map(ChangeRow::into_change).transpose()
    }

    fn latest_changes(&self, schema: &str) -> MigrationResult<Vec<Change>> {
        let table = LedgerTable::Change.table_name(schema);
        let sql = format!(
            "SELECT {columns} FROM {table} c \
             WHERE c.id = (SELECT l.id FROM {table} l WHERE lower(l.location) = lower(c.location) \
                           ORDER BY l.deployed_at DESC, l.id DESC LIMIT 1) \
             ORDER BY c.deployed_at DESC, c.id DESC",
            columns = CHANGE_COLUMNS,
            table = table,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], ChangeRow::from_row)?;
        rows.map(|row| row.map_err(MigrationError::from).and_then(ChangeRow::into_change))
            .collect()
    }

    fn changes_for_tag(&self, schema: &str, tag: &str) -> MigrationResult<Vec<Change>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE deployment_tag = ?1 ORDER BY deployed_at, id",
            CHANGE_COLUMNS,
            LedgerTable::Change.table_name(schema)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![tag], ChangeRow::from_row)?;
        rows.map(|row| row.map_err(MigrationError::from).and_then(ChangeRow::into_change))
            .collect()
    }

    fn max_deployed_at(&self, schema: &str) -> MigrationResult<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MAX(deployed_at) FROM {}",
            LedgerTable::Change.table_name(schema)
        );
        let max: Option<String> = self.conn.query_row(&sql, [], |row| row.get(0))?;
        max.as_deref().map(parse_timestamp).transpose()
    }
}
