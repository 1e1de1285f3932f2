//! # History Ledger
//!
//! Durable, append-only record of every deployment and every change a
//! deployment applied or reverted. The ledger lives in the target database
//! (three tables prefixed by the history schema name) so that, in
//! single-transaction mode, ledger rows commit or vanish together with the
//! scripts they describe.
//!
//! Rows are never updated except for closing a deployment, which happens
//! exactly once. The latest change for a location is the one with the
//! greatest `deployed_at`; [`Ledger::stamp`] keeps those timestamps strictly
//! increasing within and across runs.

pub mod memory;
pub mod sqlite;
pub mod version;

pub use version::{LedgerState, LEDGER_SCHEMA_VERSION};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::migrations::{ErrorDetails, MigratePolicy, Migration, MigrationError, MigrationResult};

/// Outcome recorded for one change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Migrated,
    Remigrated,
    Rollbacked,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Migrated => "migrated",
            ChangeStatus::Remigrated => "remigrated",
            ChangeStatus::Rollbacked => "rollbacked",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "migrated" => Ok(ChangeStatus::Migrated),
            "remigrated" => Ok(ChangeStatus::Remigrated),
            "rollbacked" => Ok(ChangeStatus::Rollbacked),
            other => Err(MigrationError::ledger(format!("unknown change status '{}'", other))),
        }
    }
}

/// Deployment command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Migrate,
    Rollback,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Migrate => "migrate",
            Command::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "migrate" => Ok(Command::Migrate),
            "rollback" => Ok(Command::Rollback),
            other => Err(MigrationError::ledger(format!("unknown command '{}'", other))),
        }
    }
}

/// One immutable ledger row for a migration applied or reverted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub location: String,
    pub deployment_tag: String,
    pub migrate_policy: MigratePolicy,
    pub status: ChangeStatus,
    pub author: String,
    pub checksum: String,
    pub description: String,
    pub authored_at: Option<DateTime<Utc>>,
    pub deployed_at: DateTime<Utc>,
}

/// One run of the engine against a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub tag: String,
    pub command: Command,
    pub deployer: String,
    pub application: String,
    pub schema_version: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorDetails>,
}

impl Deployment {
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.is_closed() && self.error.is_none()
    }
}

/// Tables making up one ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LedgerTable {
    Deployment,
    Change,
    Version,
}

impl LedgerTable {
    pub const ALL: [LedgerTable; 3] = [LedgerTable::Deployment, LedgerTable::Change, LedgerTable::Version];

    pub fn suffix(&self) -> &'static str {
        match self {
            LedgerTable::Deployment => "deployment",
            LedgerTable::Change => "change",
            LedgerTable::Version => "version",
        }
    }

    /// Physical table name for a history schema
    pub fn table_name(&self, schema: &str) -> String {
        format!("{}_{}", schema, self.suffix())
    }
}

/// Storage for ledger rows, implemented by each session
///
/// Every method takes the history schema so a single database can host
/// several independent ledgers.
pub trait HistoryStore {
    /// Ledger tables that currently exist
    fn ledger_tables(&self, schema: &str) -> MigrationResult<Vec<LedgerTable>>;

    /// Installed ledger schema version, `None` when the version table is empty
    fn ledger_version(&self, schema: &str) -> MigrationResult<Option<u32>>;

    /// Create all ledger tables and record `version`
    fn install_ledger(
        &mut self,
        schema: &str,
        version: u32,
        installed_at: DateTime<Utc>,
    ) -> MigrationResult<()>;

    fn insert_deployment(&mut self, schema: &str, deployment: &Deployment) -> MigrationResult<()>;

    /// Set `ended_at` and the error of an open deployment
    fn close_deployment(
        &mut self,
        schema: &str,
        tag: &str,
        ended_at: DateTime<Utc>,
        error: Option<&ErrorDetails>,
    ) -> MigrationResult<()>;

    fn insert_change(&mut self, schema: &str, change: &Change) -> MigrationResult<()>;

    fn find_deployment(&self, schema: &str, tag: &str) -> MigrationResult<Option<Deployment>>;

    /// Most recent change for a location, compared case-insensitively
    fn latest_change(&self, schema: &str, location: &str) -> MigrationResult<Option<Change>>;

    /// Most recent change of every location, newest first
    fn latest_changes(&self, schema: &str) -> MigrationResult<Vec<Change>>;

    /// Changes written under one deployment tag, oldest first
    fn changes_for_tag(&self, schema: &str, tag: &str) -> MigrationResult<Vec<Change>>;

    fn max_deployed_at(&self, schema: &str) -> MigrationResult<Option<DateTime<Utc>>>;
}

/// RFC 3339 with microseconds and an explicit offset
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub fn parse_timestamp(raw: &str) -> MigrationResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| MigrationError::ledger(format!("invalid timestamp '{}': {}", raw, e)))
}

/// Validate a history schema name
pub fn validate_schema_name(schema: &str) -> MigrationResult<()> {
    let pattern = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
        .map_err(|e| MigrationError::internal(e.to_string()))?;
    if pattern.is_match(schema) {
        Ok(())
    } else {
        Err(MigrationError::validation(
            "history schema",
            format!("'{}' must be a letter or underscore followed by letters, digits or underscores", schema),
        ))
    }
}

/// Ledger operations for one history schema
#[derive(Debug, Clone)]
pub struct Ledger {
    schema: String,
    last_stamp: Option<DateTime<Utc>>,
}

impl Ledger {
    pub fn new(schema: &str) -> MigrationResult<Self> {
        validate_schema_name(schema)?;
        Ok(Self {
            schema: schema.to_string(),
            last_stamp: None,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Inspect without modifying anything
    pub fn inspect<S: HistoryStore + ?Sized>(&self, store: &S) -> MigrationResult<LedgerState> {
        version::inspect(store, &self.schema)
    }

    /// Verify the ledger, installing it when missing and `bootstrap` is set
    pub fn prepare<S: HistoryStore + ?Sized>(
        &mut self,
        store: &mut S,
        bootstrap: bool,
    ) -> MigrationResult<LedgerState> {
        let mut state = version::inspect(store, &self.schema)?;
        if state == LedgerState::Missing && bootstrap {
            let installed_at = self.stamp();
            store.install_ledger(&self.schema, LEDGER_SCHEMA_VERSION, installed_at)?;
            info!(schema = %self.schema, version = LEDGER_SCHEMA_VERSION, "installed history ledger");
            state = LedgerState::Ready;
        }
        if state == LedgerState::Ready {
            self.observe(store.max_deployed_at(&self.schema)?);
        }
        Ok(state)
    }

    /// Next ledger timestamp, strictly greater than every one handed out
    /// or observed before
    pub fn stamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now().trunc_subsecs(6);
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn observe(&mut self, ts: Option<DateTime<Utc>>) {
        if let Some(ts) = ts {
            if self.last_stamp.map_or(true, |last| ts > last) {
                self.last_stamp = Some(ts);
            }
        }
    }

    /// Insert a new deployment row; the tag must be unused
    pub fn open_deployment<S: HistoryStore + ?Sized>(
        &mut self,
        store: &mut S,
        tag: &str,
        command: Command,
        deployer: &str,
        application: &str,
    ) -> MigrationResult<Deployment> {
        if store.find_deployment(&self.schema, tag)?.is_some() {
            return Err(MigrationError::DuplicateTag(tag.to_string()));
        }

        let deployment = Deployment {
            tag: tag.to_string(),
            command,
            deployer: deployer.to_string(),
            application: application.to_string(),
            schema_version: LEDGER_SCHEMA_VERSION,
            started_at: self.stamp(),
            ended_at: None,
            error: None,
        };
        store.insert_deployment(&self.schema, &deployment)?;
        debug!(tag, command = %command, "opened deployment");
        Ok(deployment)
    }

    pub fn close_deployment<S: HistoryStore + ?Sized>(
        &mut self,
        store: &mut S,
        tag: &str,
        error: Option<&ErrorDetails>,
    ) -> MigrationResult<DateTime<Utc>> {
        let ended_at = self.stamp();
        store.close_deployment(&self.schema, tag, ended_at, error)?;
        debug!(tag, failed = error.is_some(), "closed deployment");
        Ok(ended_at)
    }

    /// Append a change row describing `migration`
    pub fn record_change<S: HistoryStore + ?Sized>(
        &mut self,
        store: &mut S,
        migration: &Migration,
        tag: &str,
        status: ChangeStatus,
    ) -> MigrationResult<Change> {
        let change = Change {
            location: migration.location.clone(),
            deployment_tag: tag.to_string(),
            migrate_policy: migration.policy,
            status,
            author: migration.author.clone(),
            checksum: migration.checksum.clone(),
            description: migration.description.clone(),
            authored_at: migration.authored_at,
            deployed_at: self.stamp(),
        };
        store.insert_change(&self.schema, &change)?;
        debug!(location = %change.location, status = %status, tag, "recorded change");
        Ok(change)
    }

    pub fn latest_change<S: HistoryStore + ?Sized>(
        &self,
        store: &S,
        location: &str,
    ) -> MigrationResult<Option<Change>> {
        store.latest_change(&self.schema, location)
    }

    pub fn latest_changes<S: HistoryStore + ?Sized>(&self, store: &S) -> MigrationResult<Vec<Change>> {
        store.latest_changes(&self.schema)
    }

    pub fn changes_for_tag<S: HistoryStore + ?Sized>(
        &self,
        store: &S,
        tag: &str,
    ) -> MigrationResult<Vec<Change>> {
        store.changes_for_tag(&self.schema, tag)
    }

    pub fn deployment<S: HistoryStore + ?Sized>(
        &self,
        store: &S,
        tag: &str,
    ) -> MigrationResult<Option<Deployment>> {
        store.find_deployment(&self.schema, tag)
    }
}
