//! # Rollback Selector
//!
//! Picks the changes a rollback reverses. Every strategy works on the
//! latest change of each location, drops locations whose latest change is
//! already rolled back, and returns newest first.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::history::{Change, ChangeStatus, HistoryStore, Ledger};
use crate::migrations::{normalize_location, MigrationError, MigrationResult};

/// How to choose the changes to reverse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStrategy {
    /// The N most recent changes
    Count(usize),
    /// Changes deployed after the given deployment ended
    Tag(String),
    /// Changes deployed after the instant
    Date(DateTime<Utc>),
    /// The latest change of each listed location
    Paths(Vec<String>),
}

impl RollbackStrategy {
    pub fn validate(&self) -> MigrationResult<()> {
        match self {
            RollbackStrategy::Count(0) => Err(MigrationError::validation(
                "rollback count",
                "must be at least 1",
            )),
            RollbackStrategy::Tag(tag) if tag.trim().is_empty() => Err(MigrationError::validation(
                "rollback tag",
                "cannot be empty",
            )),
            RollbackStrategy::Paths(paths) if paths.is_empty() => Err(MigrationError::validation(
                "rollback paths",
                "at least one location is required",
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackStrategy::Count(n) => write!(f, "count {}", n),
            RollbackStrategy::Tag(tag) => write!(f, "after deployment {}", tag),
            RollbackStrategy::Date(date) => write!(f, "after {}", date.to_rfc3339()),
            RollbackStrategy::Paths(paths) => write!(f, "paths {}", paths.join(", ")),
        }
    }
}

/// Changes to reverse under `strategy`, newest first
pub fn select<S: HistoryStore + ?Sized>(
    ledger: &Ledger,
    store: &S,
    strategy: &RollbackStrategy,
) -> MigrationResult<Vec<Change>> {
    strategy.validate()?;

    if let RollbackStrategy::Paths(paths) = strategy {
        return select_paths(ledger, store, paths);
    }

    let active = ledger
        .latest_changes(store)?
        .into_iter()
        .filter(|change| change.status != ChangeStatus::Rollbacked);

    let selected: Vec<Change> = match strategy {
        RollbackStrategy::Count(count) => active.take(*count).collect(),
        RollbackStrategy::Tag(tag) => {
            let deployment = ledger
                .deployment(store, tag)?
                .ok_or_else(|| MigrationError::DeploymentNotFound(tag.clone()))?;
            let ended_at = deployment
                .ended_at
                .ok_or_else(|| MigrationError::DeploymentNotClosed(tag.clone()))?;
            active.filter(|change| change.deployed_at > ended_at).collect()
        }
        RollbackStrategy::Date(date) => active.filter(|change| change.deployed_at > *date).collect(),
        RollbackStrategy::Paths(_) => Vec::new(),
    };
    Ok(selected)
}

fn select_paths<S: HistoryStore + ?Sized>(
    ledger: &Ledger,
    store: &S,
    paths: &[String],
) -> MigrationResult<Vec<Change>> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for path in paths {
        if !seen.insert(normalize_location(path)) {
            continue;
        }
        let latest = ledger
            .latest_change(store, path)?
            .ok_or_else(|| MigrationError::NoHistory {
                location: path.clone(),
            })?;
        if latest.status == ChangeStatus::Rollbacked {
            info!(location = %latest.location, "already rolled back, skipping");
            continue;
        }
        selected.push(latest);
    }

    selected.sort_by(|a, b| b.deployed_at.cmp(&a.deployed_at));
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::memory::{MemoryServer, MemorySession};
    use crate::history::Command;
    use crate::migrations::{MigratePolicy, Migration};
    use pretty_assertions::assert_eq;

    struct Fixture {
        session: MemorySession,
        ledger: Ledger,
    }

    impl Fixture {
        fn new() -> Self {
            let server = MemoryServer::new();
            let mut session = MemorySession::connect(&server);
            let mut ledger = Ledger::new("hist").unwrap();
            ledger.prepare(&mut session, true).unwrap();
            Self { session, ledger }
        }

        fn deploy(&mut self, tag: &str, command: Command, entries: &[(&str, ChangeStatus)]) {
            self.ledger
                .open_deployment(&mut self.session, tag, command, "me", "app")
                .unwrap();
            for (location, status) in entries {
                let migration = Migration::sql(*location, MigratePolicy::AlwaysAfter, "SELECT 1", Some("SELECT 0"));
                self.ledger
                    .record_change(&mut self.session, &migration, tag, *status)
                    .unwrap();
            }
            self.ledger.close_deployment(&mut self.session, tag, None).unwrap();
        }

        fn select(&self, strategy: RollbackStrategy) -> MigrationResult<Vec<String>> {
            select(&self.ledger, &self.session, &strategy)
                .map(|changes| changes.into_iter().map(|c| c.location).collect())
        }
    }

    #[test]
    fn test_count_returns_distinct_latest() {
        let mut fx = Fixture::new();
        fx.deploy(
            "t1",
            Command::Migrate,
            &[
                ("a.yaml", ChangeStatus::Migrated),
                ("b.yaml", ChangeStatus::Migrated),
                ("c.yaml", ChangeStatus::Migrated),
            ],
        );
        fx.deploy("t2", Command::Migrate, &[("a.yaml", ChangeStatus::Remigrated)]);

        assert_eq!(fx.select(RollbackStrategy::Count(2)).unwrap(), vec!["a.yaml", "c.yaml"]);
        assert_eq!(
            fx.select(RollbackStrategy::Count(10)).unwrap(),
            vec!["a.yaml", "c.yaml", "b.yaml"]
        );
    }

    #[test]
    fn test_rollbacked_locations_excluded() {
        let mut fx = Fixture::new();
        fx.deploy(
            "t1",
            Command::Migrate,
            &[("a.yaml", ChangeStatus::Migrated), ("b.yaml", ChangeStatus::Migrated)],
        );
        fx.deploy("r1", Command::Rollback, &[("b.yaml", ChangeStatus::Rollbacked)]);

        assert_eq!(fx.select(RollbackStrategy::Count(5)).unwrap(), vec!["a.yaml"]);
        assert_eq!(
            fx.select(RollbackStrategy::Paths(vec!["b.yaml".to_string(), "a.yaml".to_string()]))
                .unwrap(),
            vec!["a.yaml"]
        );
    }

    #[test]
    fn test_tag_selects_later_changes() {
        let mut fx = Fixture::new();
        fx.deploy("t1", Command::Migrate, &[("a.yaml", ChangeStatus::Migrated)]);
        fx.deploy("t2", Command::Migrate, &[("b.yaml", ChangeStatus::Migrated)]);
        fx.deploy("t3", Command::Migrate, &[("c.yaml", ChangeStatus::Migrated)]);

        assert_eq!(
            fx.select(RollbackStrategy::Tag("t1".to_string())).unwrap(),
            vec!["c.yaml", "b.yaml"]
        );
        assert!(fx.select(RollbackStrategy::Tag("t3".to_string())).unwrap().is_empty());
        assert!(matches!(
            fx.select(RollbackStrategy::Tag("nope".to_string())),
            Err(MigrationError::DeploymentNotFound(_))
        ));
    }

    #[test]
    fn test_tag_of_open_deployment_rejected() {
        let mut fx = Fixture::new();
        fx.ledger
            .open_deployment(&mut fx.session, "open", Command::Migrate, "me", "app")
            .unwrap();
        assert!(matches!(
            fx.select(RollbackStrategy::Tag("open".to_string())),
            Err(MigrationError::DeploymentNotClosed(_))
        ));
    }

    #[test]
    fn test_date_strategy() {
        let mut fx = Fixture::new();
        fx.deploy("t1", Command::Migrate, &[("a.yaml", ChangeStatus::Migrated)]);
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        fx.deploy("t2", Command::Migrate, &[("b.yaml", ChangeStatus::Migrated)]);

        assert_eq!(fx.select(RollbackStrategy::Date(cutoff)).unwrap(), vec!["b.yaml"]);
    }

    #[test]
    fn test_paths_without_history() {
        let mut fx = Fixture::new();
        fx.deploy("t1", Command::Migrate, &[("a.yaml", ChangeStatus::Migrated)]);
        assert!(matches!(
            fx.select(RollbackStrategy::Paths(vec!["zzz.yaml".to_string()])),
            Err(MigrationError::NoHistory { .. })
        ));
        assert_eq!(
            fx.select(RollbackStrategy::Paths(vec!["A.yaml".to_string(), "a.yaml".to_string()]))
                .unwrap(),
            vec!["a.yaml"]
        );
    }

    #[test]
    fn test_invalid_strategies() {
        let fx = Fixture::new();
        assert!(fx.select(RollbackStrategy::Count(0)).is_err());
        assert!(fx.select(RollbackStrategy::Paths(Vec::new())).is_err());
        assert!(fx.select(RollbackStrategy::Tag(" ".to_string())).is_err());
    }
}
