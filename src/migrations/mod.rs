//! # Migrations
//!
//! Versioned scripts and the rules deciding when they run.
//!
//! A migration is identified by its store-relative `location` and carries a
//! content checksum plus a [`MigratePolicy`]. The policy decides whether an
//! unchanged or changed script runs again:
//!
//! | policy             | first deploy | unchanged | changed   |
//! |--------------------|--------------|-----------|-----------|
//! | `once`             | migrate      | skip      | drift     |
//! | `onchange-*`       | migrate      | skip      | remigrate |
//! | `always-*`         | migrate      | remigrate | remigrate |
//!
//! # Migration File Format
//!
//! ```yaml
//! policy: once
//! author: alice
//! description: create users
//! authored_at: 2026-02-08T00:00:00Z
//! migrate: |
//!   CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
//! rollback: |
//!   DROP TABLE users;
//! ```

pub mod checksum;
pub mod errors;
pub mod generator;
pub mod policy;
pub mod store;

pub use errors::{DriftReason, ErrorDetails, ErrorOrigin, MigrationError, MigrationResult};
pub use policy::{evaluate, Disposition};
pub use store::{FsMigrationStore, MigrationStore, MigrationStream, StoreOptions, VecMigrationStore};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Session;

/// Governs whether an unchanged or changed script runs again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MigratePolicy {
    #[default]
    Once,
    AlwaysBefore,
    AlwaysAfter,
    OnchangeBefore,
    OnchangeAfter,
}

impl MigratePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigratePolicy::Once => "once",
            MigratePolicy::AlwaysBefore => "always-before",
            MigratePolicy::AlwaysAfter => "always-after",
            MigratePolicy::OnchangeBefore => "onchange-before",
            MigratePolicy::OnchangeAfter => "onchange-after",
        }
    }

    /// Content-driven policies rerun only when the checksum changes
    pub fn is_onchange(&self) -> bool {
        matches!(self, MigratePolicy::OnchangeBefore | MigratePolicy::OnchangeAfter)
    }

    pub fn is_always(&self) -> bool {
        matches!(self, MigratePolicy::AlwaysBefore | MigratePolicy::AlwaysAfter)
    }
}

impl fmt::Display for MigratePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigratePolicy {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(MigratePolicy::Once),
            "always-before" => Ok(MigratePolicy::AlwaysBefore),
            "always-after" => Ok(MigratePolicy::AlwaysAfter),
            "onchange-before" => Ok(MigratePolicy::OnchangeBefore),
            "onchange-after" => Ok(MigratePolicy::OnchangeAfter),
            other => Err(MigrationError::validation(
                "migrate policy",
                format!("unknown policy '{}'", other),
            )),
        }
    }
}

/// Executable body of a migration
pub trait Script: Send + Sync + fmt::Debug {
    /// Apply the migration against the target session
    fn migrate(&self, session: &mut dyn Session) -> MigrationResult<()>;

    /// Reverse the migration. Only called when [`Script::is_reversible`].
    fn rollback(&self, session: &mut dyn Session) -> MigrationResult<()>;

    fn is_reversible(&self) -> bool;
}

/// Plain SQL script with an optional rollback section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript {
    pub migrate: String,
    pub rollback: Option<String>,
}

impl SqlScript {
    pub fn new(migrate: impl Into<String>, rollback: Option<String>) -> Self {
        Self {
            migrate: migrate.into(),
            rollback,
        }
    }
}

impl Script for SqlScript {
    fn migrate(&self, session: &mut dyn Session) -> MigrationResult<()> {
        session.execute(&self.migrate)
    }

    fn rollback(&self, session: &mut dyn Session) -> MigrationResult<()> {
        match &self.rollback {
            Some(sql) => session.execute(sql),
            None => Err(MigrationError::internal("script has no rollback section")),
        }
    }

    fn is_reversible(&self) -> bool {
        self.rollback
            .as_deref()
            .map(|sql| !sql.trim().is_empty())
            .unwrap_or(false)
    }
}

/// A single versioned migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Store-relative path, `/`-separated
    pub location: String,

    /// Content checksum
    pub checksum: String,

    pub policy: MigratePolicy,

    pub author: String,

    pub description: String,

    pub authored_at: Option<DateTime<Utc>>,

    pub script: Arc<dyn Script>,
}

impl Migration {
    /// Build a SQL migration whose checksum covers both script sections.
    pub fn sql(
        location: impl Into<String>,
        policy: MigratePolicy,
        migrate: impl Into<String>,
        rollback: Option<&str>,
    ) -> Self {
        let migrate = migrate.into();
        let mut content = migrate.clone().into_bytes();
        if let Some(down) = rollback {
            content.push(0);
            content.extend_from_slice(down.as_bytes());
        }

        Self {
            location: location.into(),
            checksum: checksum::compute_checksum(&content),
            policy,
            author: String::new(),
            description: String::new(),
            authored_at: None,
            script: Arc::new(SqlScript::new(migrate, rollback.map(str::to_string))),
        }
    }

    /// Case-insensitive location comparison
    pub fn is_at(&self, location: &str) -> bool {
        same_location(&self.location, location)
    }

    /// Validate migration structure
    pub fn validate(&self) -> MigrationResult<()> {
        if self.location.trim().is_empty() {
            return Err(MigrationError::validation("location", "cannot be empty"));
        }
        if self.checksum.is_empty() {
            return Err(MigrationError::validation(
                "checksum",
                format!("missing for '{}'", self.location),
            ));
        }
        Ok(())
    }
}

/// Locations are unique regardless of case
pub fn same_location(a: &str, b: &str) -> bool {
    normalize_location(a) == normalize_location(b)
}

/// Canonical key for location comparisons
pub fn normalize_location(location: &str) -> String {
    location.trim().replace('\\', "/").to_lowercase()
}

/// On-disk representation of a migration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationFile {
    #[serde(default)]
    pub policy: MigratePolicy,

    #[serde(default)]
    pub author: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub authored_at: Option<DateTime<Utc>>,

    pub migrate: String,

    #[serde(default)]
    pub rollback: Option<String>,
}

impl MigrationFile {
    /// Turn a parsed file into a migration at `location`
    pub fn into_migration(self, location: String, checksum: String) -> Migration {
        Migration {
            location,
            checksum,
            policy: self.policy,
            author: self.author,
            description: self.description,
            authored_at: self.authored_at,
            script: Arc::new(SqlScript::new(self.migrate, self.rollback)),
        }
    }
}
