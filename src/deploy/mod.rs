//! # Deployment Coordinator
//!
//! Drives one deployment unit against a target session:
//!
//! ```text
//! Idle -> Locked -> Opened -> Running -> Committed | Aborted -> Closed -> Unlocked
//! ```
//!
//! Every step is a [`Task`](crate::task::Task). A failing step unwinds the
//! completed ones in reverse: the open transaction is rolled back, the
//! deployment row is closed with the failure, and the lock is released.
//!
//! # Transaction Modes
//!
//! - `single`: one transaction spans all scripts and their ledger rows. A
//!   failure leaves no change recorded under the deployment tag.
//! - `per-change`: each script and its ledger row commit together. A failure
//!   rolls back only the change in flight; earlier changes stay.

pub mod rollback;
mod tasks;

pub use rollback::RollbackStrategy;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::history::{Change, ChangeStatus, Command, Ledger, LedgerState};
use crate::hooks::{HookEnv, HookEvent, HookRunner, NoHooks};
use crate::lock::{Lock, DEFAULT_POLL_INTERVAL};
use crate::migrations::{
    evaluate, normalize_location, Disposition, Migration, MigrationError, MigrationResult,
    MigrationStore,
};
use crate::session::Backend;
use crate::task::{NullObserver, Task, TaskObserver, TaskRunner};
use tasks::{
    AcquireLock, ApplyMigration, BeginTransaction, CloseDeployment, CommitTransaction,
    DeployContext, FireHook, OpenDeployment, PrepareLedger, ReleaseLock, RevertChange,
    SelectRollback,
};

/// Transaction boundary used while running scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionMode {
    #[default]
    Single,
    PerChange,
}

impl TransactionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionMode::Single => "single",
            TransactionMode::PerChange => "per-change",
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionMode {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(TransactionMode::Single),
            "per-change" => Ok(TransactionMode::PerChange),
            other => Err(MigrationError::validation(
                "transaction mode",
                format!("expected 'single' or 'per-change', got '{}'", other),
            )),
        }
    }
}

/// Per-target settings of a deployment
#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub history_schema: String,
    pub transaction_mode: TransactionMode,
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    pub deployer: String,
    pub application: String,
    /// Shown to hooks only
    pub dsn: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            history_schema: "migrata".to_string(),
            transaction_mode: TransactionMode::Single,
            lock_timeout: Duration::from_secs(30),
            lock_poll: DEFAULT_POLL_INTERVAL,
            deployer: whoami::username(),
            application: "migrata".to_string(),
            dsn: String::new(),
        }
    }
}

/// Forward deployment request
#[derive(Debug, Clone, Default)]
pub struct MigrateRequest {
    /// Deployment tag; generated when absent
    pub tag: Option<String>,
    /// Stop after this many applied changes
    pub limit: Option<usize>,
    /// Only consider these locations
    pub paths: Vec<String>,
    pub dry_run: bool,
}

/// Rollback request
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub tag: Option<String>,
    pub strategy: RollbackStrategy,
    pub dry_run: bool,
}

impl RollbackRequest {
    pub fn new(strategy: RollbackStrategy) -> Self {
        Self {
            tag: None,
            strategy,
            dry_run: false,
        }
    }
}

/// What happened, or would happen, to one migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryAction {
    Migrate,
    Remigrate,
    Rollback,
    /// Checksum mismatch that would abort the deployment
    Drift,
    /// Rollback that cannot proceed (missing, changed or irreversible script)
    Blocked,
}

impl From<ChangeStatus> for EntryAction {
    fn from(status: ChangeStatus) -> Self {
        match status {
            ChangeStatus::Migrated => EntryAction::Migrate,
            ChangeStatus::Remigrated => EntryAction::Remigrate,
            ChangeStatus::Rollbacked => EntryAction::Rollback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub location: String,
    pub action: EntryAction,
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

/// Summary of a deployment or of a dry-run plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentReport {
    pub tag: String,
    pub command: Command,
    pub dry_run: bool,
    pub entries: Vec<ReportEntry>,
    pub skipped: usize,
}

impl DeploymentReport {
    fn new(tag: String, command: Command, dry_run: bool) -> Self {
        Self {
            tag,
            command,
            dry_run,
            entries: Vec::new(),
            skipped: 0,
        }
    }

    pub fn locations(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.location.as_str()).collect()
    }
}

/// Ledger state plus pending work, for `status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub history_schema: String,
    pub ledger_installed: bool,
    pub applied: Vec<Change>,
    pub pending: Vec<ReportEntry>,
}

fn resolve_tag(tag: Option<&str>) -> MigrationResult<String> {
    match tag.map(str::trim) {
        Some("") => Err(MigrationError::validation("deployment tag", "cannot be empty")),
        Some(tag) => Ok(tag.to_string()),
        None => Ok(Uuid::now_v7().to_string()),
    }
}

/// Runs deployments for one session and migration store
pub struct Coordinator<'a> {
    session: &'a mut dyn Backend,
    store: &'a dyn MigrationStore,
    settings: DeploySettings,
    hooks: Box<dyn HookRunner + 'a>,
    observer: Box<dyn TaskObserver + 'a>,
    interrupt: Arc<AtomicBool>,
    lock: Option<Box<dyn Lock>>,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        session: &'a mut dyn Backend,
        store: &'a dyn MigrationStore,
        settings: DeploySettings,
    ) -> Self {
        Self {
            session,
            store,
            settings,
            hooks: Box::new(NoHooks),
            observer: Box::new(NullObserver),
            interrupt: Arc::new(AtomicBool::new(false)),
            lock: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Box<dyn HookRunner + 'a>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn TaskObserver + 'a>) -> Self {
        self.observer = observer;
        self
    }

    /// Honor `flag` between steps
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    /// Use `lock` instead of the one derived from the session
    pub fn with_lock(mut self, lock: Box<dyn Lock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    fn ledger(&self) -> MigrationResult<Ledger> {
        Ledger::new(&self.settings.history_schema)
    }

    fn hook_env(&self, tag: &str, command: Command, dry_run: bool) -> HookEnv {
        HookEnv::for_deployment(
            tag,
            command,
            &self.settings.deployer,
            &self.settings.dsn,
            dry_run,
            self.settings.transaction_mode == TransactionMode::Single,
        )
    }

    /// Apply pending migrations
    pub fn migrate(&mut self, request: &MigrateRequest) -> MigrationResult<DeploymentReport> {
        self.check_paths(&request.paths)?;
        if request.dry_run {
            return self.plan_migrate(request);
        }
        let tag = resolve_tag(request.tag.as_deref())?;
        info!(tag = %tag, schema = %self.settings.history_schema, "starting migrate");

        let ledger = self.ledger()?;
        let env = self.hook_env(&tag, Command::Migrate, false);
        let single = self.settings.transaction_mode == TransactionMode::Single;
        let limit = request.limit;
        let paths: Vec<String> = request.paths.iter().map(|p| normalize_location(p)).collect();

        let mut ctx = DeployContext {
            session: &mut *self.session,
            store: self.store,
            hooks: &mut *self.hooks,
            settings: &self.settings,
            ledger,
            lock: self.lock.take(),
            tag: tag.clone(),
            command: Command::Migrate,
            env,
            report: DeploymentReport::new(tag, Command::Migrate, false),
            selection: Vec::new(),
            deployment_open: false,
        };
        let mut runner = TaskRunner::new(&mut *self.observer).with_interrupt(Arc::clone(&self.interrupt));

        runner.execute_all(Self::opening_steps(), &mut ctx)?;
        if single {
            runner.execute(Box::new(BeginTransaction), &mut ctx)?;
        }

        let store = ctx.store;
        let stream = match store.migrations() {
            Ok(stream) => stream,
            Err(e) => return Err(runner.unwind(&mut ctx, e)),
        };
        for item in stream {
            if limit.is_some_and(|limit| ctx.report.entries.len() >= limit) {
                break;
            }
            let migration = match item {
                Ok(migration) => migration,
                Err(e) => return Err(runner.unwind(&mut ctx, e)),
            };
            if !paths.is_empty() && !paths.contains(&normalize_location(&migration.location)) {
                continue;
            }
            runner.execute(Box::new(ApplyMigration::new(migration)), &mut ctx)?;
        }

        if single {
            runner.execute(Box::new(CommitTransaction), &mut ctx)?;
        }
        runner.execute_all(Self::closing_steps(), &mut ctx)?;
        runner.finish();

        info!(
            tag = %ctx.report.tag,
            applied = ctx.report.entries.len(),
            skipped = ctx.report.skipped,
            "migrate finished"
        );
        Ok(ctx.report)
    }

    /// Reverse previously deployed changes
    pub fn rollback(&mut self, request: &RollbackRequest) -> MigrationResult<DeploymentReport> {
        request.strategy.validate()?;
        if request.dry_run {
            return self.plan_rollback(request);
        }
        let tag = resolve_tag(request.tag.as_deref())?;
        info!(tag = %tag, strategy = %request.strategy, "starting rollback");

        let ledger = self.ledger()?;
        let env = self.hook_env(&tag, Command::Rollback, false);
        let single = self.settings.transaction_mode == TransactionMode::Single;

        let mut ctx = DeployContext {
            session: &mut *self.session,
            store: self.store,
            hooks: &mut *self.hooks,
            settings: &self.settings,
            ledger,
            lock: self.lock.take(),
            tag: tag.clone(),
            command: Command::Rollback,
            env,
            report: DeploymentReport::new(tag, Command::Rollback, false),
            selection: Vec::new(),
            deployment_open: false,
        };
        let mut runner = TaskRunner::new(&mut *self.observer).with_interrupt(Arc::clone(&self.interrupt));

        runner.execute_all(Self::opening_steps(), &mut ctx)?;
        runner.execute(Box::new(SelectRollback::new(request.strategy.clone())), &mut ctx)?;
        if single {
            runner.execute(Box::new(BeginTransaction), &mut ctx)?;
        }
        for change in std::mem::take(&mut ctx.selection) {
            runner.execute(Box::new(RevertChange::new(change)), &mut ctx)?;
        }
        if single {
            runner.execute(Box::new(CommitTransaction), &mut ctx)?;
        }
        runner.execute_all(Self::closing_steps(), &mut ctx)?;
        runner.finish();

        info!(tag = %ctx.report.tag, reverted = ctx.report.entries.len(), "rollback finished");
        Ok(ctx.report)
    }

    fn opening_steps<'t, 'c>() -> Vec<Box<dyn Task<DeployContext<'c>> + 't>> {
        vec![
            Box::new(FireHook::new(HookEvent::BeforeConnect)),
            Box::new(AcquireLock),
            Box::new(PrepareLedger),
            Box::new(FireHook::new(HookEvent::AfterConnect)),
            Box::new(OpenDeployment),
            Box::new(FireHook::new(HookEvent::BeforeDeploy)),
        ]
    }

    fn closing_steps<'t, 'c>() -> Vec<Box<dyn Task<DeployContext<'c>> + 't>> {
        vec![
            Box::new(FireHook::new(HookEvent::AfterDeploy)),
            Box::new(CloseDeployment),
            Box::new(ReleaseLock),
        ]
    }

    /// Every explicitly requested location must exist in the store
    fn check_paths(&self, paths: &[String]) -> MigrationResult<()> {
        for path in paths {
            if self.store.get(path)?.is_none() {
                return Err(MigrationError::ScriptMissing {
                    location: path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Ledger state without side effects; a missing ledger reads as empty
    fn inspect(&self, ledger: &Ledger) -> MigrationResult<bool> {
        Ok(ledger.inspect(&*self.session)? == LedgerState::Ready)
    }

    /// What `migrate` would do, without locking or writing
    pub fn plan_migrate(&mut self, request: &MigrateRequest) -> MigrationResult<DeploymentReport> {
        self.check_paths(&request.paths)?;
        let ledger = self.ledger()?;
        let installed = self.inspect(&ledger)?;
        let tag = resolve_tag(request.tag.as_deref())?;
        let paths: Vec<String> = request.paths.iter().map(|p| normalize_location(p)).collect();
        let mut report = DeploymentReport::new(tag, Command::Migrate, true);

        let store = self.store;
        for item in store.migrations()? {
            if request
                .limit
                .is_some_and(|limit| report.entries.len() >= limit)
            {
                break;
            }
            let migration = item?;
            if !paths.is_empty() && !paths.contains(&normalize_location(&migration.location)) {
                continue;
            }
            let latest = if installed {
                ledger.latest_change(&*self.session, &migration.location)?
            } else {
                None
            };
            match Self::planned_entry(latest.as_ref(), &migration) {
                Some(entry) => report.entries.push(entry),
                None => report.skipped += 1,
            }
        }
        Ok(report)
    }

    fn planned_entry(latest: Option<&Change>, migration: &Migration) -> Option<ReportEntry> {
        let (action, detail) = match evaluate(latest, migration) {
            Disposition::Skip => return None,
            Disposition::Migrate => (EntryAction::Migrate, None),
            Disposition::Remigrate => (EntryAction::Remigrate, None),
            Disposition::Drift(reason) => (EntryAction::Drift, Some(reason.to_string())),
        };
        Some(ReportEntry {
            location: migration.location.clone(),
            action,
            checksum: migration.checksum.clone(),
            detail,
            elapsed_ms: 0,
        })
    }

    /// What `rollback` would do, without locking or writing
    pub fn plan_rollback(&mut self, request: &RollbackRequest) -> MigrationResult<DeploymentReport> {
        request.strategy.validate()?;
        let ledger = self.ledger()?;
        let tag = resolve_tag(request.tag.as_deref())?;
        let mut report = DeploymentReport::new(tag, Command::Rollback, true);
        if !self.inspect(&ledger)? {
            return Ok(report);
        }

        for change in rollback::select(&ledger, &*self.session, &request.strategy)? {
            let entry = match tasks::reversible_migration(self.store, &change) {
                Ok(migration) => ReportEntry {
                    location: migration.location,
                    action: EntryAction::Rollback,
                    checksum: migration.checksum,
                    detail: None,
                    elapsed_ms: 0,
                },
                Err(e) => {
                    warn!(location = %change.location, error = %e, "rollback would be blocked");
                    ReportEntry {
                        location: change.location,
                        action: EntryAction::Blocked,
                        checksum: change.checksum,
                        detail: Some(e.to_string()),
                        elapsed_ms: 0,
                    }
                }
            };
            report.entries.push(entry);
        }
        Ok(report)
    }

    /// Applied changes and pending work
    pub fn status(&mut self) -> MigrationResult<StatusReport> {
        let ledger = self.ledger()?;
        let installed = self.inspect(&ledger)?;
        let applied = if installed {
            ledger.latest_changes(&*self.session)?
        } else {
            Vec::new()
        };
        let plan = self.plan_migrate(&MigrateRequest {
            dry_run: true,
            ..MigrateRequest::default()
        })?;
        Ok(StatusReport {
            history_schema: self.settings.history_schema.clone(),
            ledger_installed: installed,
            applied,
            pending: plan.entries,
        })
    }
}
