//! # Deployment Hooks
//!
//! Extension points fired by the coordinator. Each hook receives a flat
//! name/value environment describing the deployment and, for per-change
//! events, the change in scope.

pub mod command;

pub use command::CommandHookRunner;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::history::{format_timestamp, Change, Command};
use crate::migrations::MigrationResult;

/// Point in a deployment where hooks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    BeforeConnect,
    AfterConnect,
    BeforeDeploy,
    BeforeEachMigrate,
    AfterEachMigrate,
    BeforeEachRollback,
    AfterEachRollback,
    AfterDeploy,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeConnect => "before-connect",
            HookEvent::AfterConnect => "after-connect",
            HookEvent::BeforeDeploy => "before-deploy",
            HookEvent::BeforeEachMigrate => "before-each-migrate",
            HookEvent::AfterEachMigrate => "after-each-migrate",
            HookEvent::BeforeEachRollback => "before-each-rollback",
            HookEvent::AfterEachRollback => "after-each-rollback",
            HookEvent::AfterDeploy => "after-deploy",
        }
    }

    /// Per-change event for a command
    pub fn before_each(command: Command) -> Self {
        match command {
            Command::Migrate => HookEvent::BeforeEachMigrate,
            Command::Rollback => HookEvent::BeforeEachRollback,
        }
    }

    pub fn after_each(command: Command) -> Self {
        match command {
            Command::Migrate => HookEvent::AfterEachMigrate,
            Command::Rollback => HookEvent::AfterEachRollback,
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat environment handed to hooks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HookEnv {
    vars: BTreeMap<String, String>,
}

impl HookEnv {
    pub const PREFIX: &'static str = "MIGRATA_";

    pub fn new() -> Self {
        Self::default()
    }

    /// Deployment-scoped variables
    pub fn for_deployment(
        tag: &str,
        command: Command,
        deployer: &str,
        dsn: &str,
        dry_run: bool,
        single_transaction: bool,
    ) -> Self {
        let mut env = Self::new();
        env.set("DEPLOYMENT_TAG", tag);
        env.set("COMMAND", command.as_str());
        env.set("DEPLOYER", deployer);
        env.set("DSN", dsn);
        env.set("DRY_RUN", dry_run.to_string());
        env.set("SINGLE_TRANSACTION", single_transaction.to_string());
        env
    }

    /// Copy with the variables of `change` added
    pub fn with_change(&self, change: &Change) -> Self {
        let mut env = self.clone();
        env.set("CHANGE_LOCATION", &change.location);
        env.set("CHANGE_POLICY", change.migrate_policy.as_str());
        env.set("CHANGE_STATUS", change.status.as_str());
        env.set("CHANGE_CHECKSUM", &change.checksum);
        env.set("CHANGE_AUTHOR", &change.author);
        env.set("CHANGE_DESCRIPTION", &change.description);
        env.set(
            "CHANGE_AUTHORED_AT",
            change.authored_at.as_ref().map(format_timestamp).unwrap_or_default(),
        );
        env.set("CHANGE_DEPLOYED_AT", format_timestamp(&change.deployed_at));
        env
    }

    /// Set `MIGRATA_<key>`
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(format!("{}{}", Self::PREFIX, key), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .or_else(|| self.vars.get(&format!("{}{}", Self::PREFIX, key)))
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Runs the hooks registered for an event
///
/// An `Err` aborts the deployment. Runners decide which failures are
/// tolerated.
pub trait HookRunner {
    fn run(&mut self, event: HookEvent, env: &HookEnv) -> MigrationResult<()>;
}

impl<H: HookRunner + ?Sized> HookRunner for &mut H {
    fn run(&mut self, event: HookEvent, env: &HookEnv) -> MigrationResult<()> {
        (**self).run(event, env)
    }
}

/// Runner without hooks
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl HookRunner for NoHooks {
    fn run(&mut self, _event: HookEvent, _env: &HookEnv) -> MigrationResult<()> {
        Ok(())
    }
}

/// Records every fired event; useful to assert hook ordering
#[derive(Debug, Default, Clone)]
pub struct RecordingHooks {
    pub fired: Vec<(HookEvent, HookEnv)>,
}

impl RecordingHooks {
    pub fn events(&self) -> Vec<HookEvent> {
        self.fired.iter().map(|(event, _)| *event).collect()
    }
}

impl HookRunner for RecordingHooks {
    fn run(&mut self, event: HookEvent, env: &HookEnv) -> MigrationResult<()> {
        self.fired.push((event, env.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChangeStatus;
    use crate::migrations::MigratePolicy;
    use chrono::Utc;

    #[test]
    fn test_event_names() {
        assert_eq!(HookEvent::BeforeEachMigrate.as_str(), "before-each-migrate");
        assert_eq!(
            serde_yaml::from_str::<HookEvent>("after-deploy").unwrap(),
            HookEvent::AfterDeploy
        );
        assert_eq!(HookEvent::after_each(Command::Rollback), HookEvent::AfterEachRollback);
    }

    #[test]
    fn test_env_prefix_and_change() {
        let env = HookEnv::for_deployment("v1", Command::Migrate, "alice", "sqlite://a.db", false, true);
        assert_eq!(env.get("MIGRATA_DEPLOYMENT_TAG"), Some("v1"));
        assert_eq!(env.get("SINGLE_TRANSACTION"), Some("true"));

        let change = Change {
            location: "a.yaml".to_string(),
            deployment_tag: "v1".to_string(),
            migrate_policy: MigratePolicy::OnchangeBefore,
            status: ChangeStatus::Migrated,
            author: "alice".to_string(),
            checksum: "sha256:ab".to_string(),
            description: "first".to_string(),
            authored_at: None,
            deployed_at: Utc::now(),
        };
        let scoped = env.with_change(&change);
        assert_eq!(scoped.get("CHANGE_POLICY"), Some("onchange-before"));
        assert_eq!(scoped.get("CHANGE_AUTHORED_AT"), Some(""));
        assert!(env.get("CHANGE_LOCATION").is_none());
        assert!(scoped.iter().all(|(k, _)| k.starts_with(HookEnv::PREFIX)));
    }
}
