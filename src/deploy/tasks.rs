//! Deployment steps run through the task framework.

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::rollback::{self, RollbackStrategy};
use super::{DeploySettings, DeploymentReport, EntryAction, ReportEntry, TransactionMode};
use crate::history::{Change, ChangeStatus, Command, Ledger};
use crate::hooks::{HookEnv, HookEvent, HookRunner};
use crate::lock::{self, Lock};
use crate::migrations::{
    evaluate, Disposition, ErrorDetails, ErrorOrigin, Migration, MigrationError, MigrationResult,
    MigrationStore,
};
use crate::session::Backend;
use crate::task::Task;

/// State shared by the steps of one deployment
pub(crate) struct DeployContext<'c> {
    pub session: &'c mut dyn Backend,
    pub store: &'c dyn MigrationStore,
    pub hooks: &'c mut dyn HookRunner,
    pub settings: &'c DeploySettings,
    pub ledger: Ledger,
    pub lock: Option<Box<dyn Lock>>,
    pub tag: String,
    pub command: Command,
    pub env: HookEnv,
    pub report: DeploymentReport,
    pub selection: Vec<Change>,
    pub deployment_open: bool,
}

impl<'c> DeployContext<'c> {
    pub fn lock_name(&self) -> String {
        format!("migrata_{}", self.ledger.schema())
    }

    fn single_transaction(&self) -> bool {
        self.settings.transaction_mode == TransactionMode::Single
    }

    fn fire(&mut self, event: HookEvent, env: &HookEnv) -> MigrationResult<()> {
        self.hooks.run(event, env)
    }

    /// Change as it will be recorded, for per-change hooks fired before the write
    fn provisional(&self, migration: &Migration, status: ChangeStatus) -> Change {
        Change {
            location: migration.location.clone(),
            deployment_tag: self.tag.clone(),
            migrate_policy: migration.policy,
            status,
            author: migration.author.clone(),
            checksum: migration.checksum.clone(),
            description: migration.description.clone(),
            authored_at: migration.authored_at,
            deployed_at: Utc::now(),
        }
    }

    /// Run `script` and record the change, inside its own transaction in
    /// per-change mode
    fn apply_and_record<F>(
        &mut self,
        migration: &Migration,
        status: ChangeStatus,
        script: F,
    ) -> MigrationResult<Change>
    where
        F: FnOnce(&mut dyn Backend) -> MigrationResult<()>,
    {
        if self.single_transaction() {
            script(&mut *self.session)?;
            let tag = self.tag.clone();
            return self.ledger.record_change(&mut *self.session, migration, &tag, status);
        }

        self.session.begin()?;
        let tag = self.tag.clone();
        let result = script(&mut *self.session)
            .and_then(|()| self.ledger.record_change(&mut *self.session, migration, &tag, status))
            .and_then(|change| self.session.commit().map(|()| change));

        if result.is_err() && self.session.in_transaction() {
            if let Err(e) = self.session.rollback() {
                warn!(location = %migration.location, error = %e, "rollback of in-flight change failed");
            }
        }
        result
    }
}

/// Fire the hooks of a deployment-scoped event
pub(crate) struct FireHook {
    event: HookEvent,
}

impl FireHook {
    pub fn new(event: HookEvent) -> Self {
        Self { event }
    }
}

impl<'c> Task<DeployContext<'c>> for FireHook {
    fn name(&self) -> &str {
        self.event.as_str()
    }

    fn description(&self) -> String {
        format!("run {} hooks", self.event)
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        let env = ctx.env.clone();
        ctx.fire(self.event, &env)
    }
}

pub(crate) struct AcquireLock;

impl<'c> Task<DeployContext<'c>> for AcquireLock {
    fn name(&self) -> &str {
        "acquire-lock"
    }

    fn description(&self) -> String {
        "acquire the deployment lock".to_string()
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        let name = ctx.lock_name();
        let timeout = ctx.settings.lock_timeout;
        let mut lock = match ctx.lock.take() {
            Some(lock) => lock,
            None => lock::create(ctx.session.lock_strategy(), ctx.settings.lock_poll),
        };

        let acquired = lock.acquire(&name, timeout)?;
        ctx.lock = Some(lock);
        if !acquired {
            return Err(MigrationError::LockTimeout {
                name,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        info!(lock = %name, "deployment lock acquired");
        Ok(())
    }

    fn compensate(&mut self, ctx: &mut DeployContext<'c>, _cause: &MigrationError) -> MigrationResult<()> {
        let name = ctx.lock_name();
        match ctx.lock.as_mut() {
            Some(lock) => lock.release(&name),
            None => Ok(()),
        }
    }
}

/// Release the deployment lock; failures are logged, never raised
pub(crate) struct ReleaseLock;

impl<'c> Task<DeployContext<'c>> for ReleaseLock {
    fn name(&self) -> &str {
        "release-lock"
    }

    fn description(&self) -> String {
        "release the deployment lock".to_string()
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        let name = ctx.lock_name();
        if let Some(lock) = ctx.lock.as_mut() {
            if let Err(e) = lock.release(&name) {
                warn!(lock = %name, error = %e, "failed to release deployment lock");
            }
        }
        Ok(())
    }
}

pub(crate) struct PrepareLedger;

impl<'c> Task<DeployContext<'c>> for PrepareLedger {
    fn name(&self) -> &str {
        "prepare-ledger"
    }

    fn description(&self) -> String {
        "verify or install the history ledger".to_string()
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        ctx.ledger.prepare(&mut *ctx.session, true)?;
        Ok(())
    }
}

/// Insert the deployment row; closes it with the failure on unwind
pub(crate) struct OpenDeployment;

impl<'c> Task<DeployContext<'c>> for OpenDeployment {
    fn name(&self) -> &str {
        "open-deployment"
    }

    fn description(&self) -> String {
        "record the deployment".to_string()
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        let tag = ctx.tag.clone();
        let settings = ctx.settings;
        ctx.ledger.open_deployment(
            &mut *ctx.session,
            &tag,
            ctx.command,
            &settings.deployer,
            &settings.application,
        )?;
        ctx.deployment_open = true;
        info!(tag = %tag, command = %ctx.command, "deployment opened");
        Ok(())
    }

    fn compensate(&mut self, ctx: &mut DeployContext<'c>, cause: &MigrationError) -> MigrationResult<()> {
        if !ctx.deployment_open {
            return Ok(());
        }
        if ctx.session.in_transaction() {
            if let Err(e) = ctx.session.rollback() {
                warn!(tag = %ctx.tag, error = %e, "rollback failed, closing the deployment anyway");
            }
        }
        let details = ErrorDetails::capture(cause);
        let tag = ctx.tag.clone();
        ctx.ledger.close_deployment(&mut *ctx.session, &tag, Some(&details))?;
        ctx.deployment_open = false;
        info!(tag = %tag, kind = %details.kind, "deployment closed with error");
        Ok(())
    }
}

pub(crate) struct CloseDeployment;

impl<'c> Task<DeployContext<'c>> for CloseDeployment {
    fn name(&self) -> &str {
        "close-deployment"
    }

    fn description(&self) -> String {
        "close the deployment".to_string()
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        let tag = ctx.tag.clone();
        ctx.ledger.close_deployment(&mut *ctx.session, &tag, None)?;
        ctx.deployment_open = false;
        info!(tag = %tag, changes = ctx.report.entries.len(), "deployment closed");
        Ok(())
    }
}

pub(crate) struct BeginTransaction;

impl<'c> Task<DeployContext<'c>> for BeginTransaction {
    fn name(&self) -> &str {
        "begin-transaction"
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        ctx.session.begin()
    }

    fn compensate(&mut self, ctx: &mut DeployContext<'c>, _cause: &MigrationError) -> MigrationResult<()> {
        if ctx.session.in_transaction() {
            debug!(tag = %ctx.tag, "rolling back deployment transaction");
            ctx.session.rollback()?;
        }
        Ok(())
    }
}

pub(crate) struct CommitTransaction;

impl<'c> Task<DeployContext<'c>> for CommitTransaction {
    fn name(&self) -> &str {
        "commit-transaction"
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        ctx.session.commit()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Attribute a script error to its migration, keeping where it was raised
fn script_failed(migration: &Migration, err: MigrationError) -> MigrationError {
    if let MigrationError::ScriptFailed { .. } = err {
        return err;
    }
    let origin = match err.origin() {
        Some(origin) => origin.clone(),
        None => ErrorOrigin::here(),
    };
    MigrationError::ScriptFailed {
        location: migration.location.clone(),
        message: err.to_string(),
        origin,
    }
}

/// Evaluate one migration and apply it when its policy says so
pub(crate) struct ApplyMigration {
    migration: Migration,
    label: String,
}

impl ApplyMigration {
    pub fn new(migration: Migration) -> Self {
        let label = format!("migrate {}", migration.location);
        Self { migration, label }
    }
}

impl<'c> Task<DeployContext<'c>> for ApplyMigration {
    fn name(&self) -> &str {
        &self.label
    }

    fn description(&self) -> String {
        if self.migration.description.is_empty() {
            self.migration.location.clone()
        } else {
            self.migration.description.clone()
        }
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        let migration = &self.migration;
        let latest = ctx.ledger.latest_change(&*ctx.session, &migration.location)?;

        let disposition = evaluate(latest.as_ref(), migration);
        debug!(location = %migration.location, disposition = disposition.as_str(), "evaluated migration");
        if let Disposition::Drift(reason) = disposition {
            return Err(MigrationError::drift(
                migration.location.clone(),
                reason,
                latest.map(|c| c.checksum).unwrap_or_default(),
                migration.checksum.clone(),
            ));
        }
        let Some(status) = disposition.status() else {
            ctx.report.skipped += 1;
            return Ok(());
        };

        let start = Instant::now();
        let before = ctx.env.with_change(&ctx.provisional(migration, status));
        ctx.fire(HookEvent::before_each(ctx.command), &before)?;

        let script = migration.script.clone();
        let change = ctx.apply_and_record(migration, status, |session| {
            script
                .migrate(session.as_session_mut())
                .map_err(|e| script_failed(migration, e))
        })?;

        let after = ctx.env.with_change(&change);
        ctx.fire(HookEvent::after_each(ctx.command), &after)?;

        info!(location = %migration.location, status = %status, "applied migration");
        ctx.report.entries.push(ReportEntry {
            location: migration.location.clone(),
            action: EntryAction::from(status),
            checksum: migration.checksum.clone(),
            detail: None,
            elapsed_ms: elapsed_ms(start),
        });
        Ok(())
    }
}

/// Pick the changes to reverse
pub(crate) struct SelectRollback {
    strategy: RollbackStrategy,
}

impl SelectRollback {
    pub fn new(strategy: RollbackStrategy) -> Self {
        Self { strategy }
    }
}

impl<'c> Task<DeployContext<'c>> for SelectRollback {
    fn name(&self) -> &str {
        "select-rollback"
    }

    fn description(&self) -> String {
        format!("select changes ({})", self.strategy)
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        ctx.selection = rollback::select(&ctx.ledger, &*ctx.session, &self.strategy)?;
        info!(count = ctx.selection.len(), strategy = %self.strategy, "selected changes to roll back");
        Ok(())
    }
}

/// Load the stored migration for a recorded change and check it can be reversed
pub(crate) fn reversible_migration(
    store: &dyn MigrationStore,
    change: &Change,
) -> MigrationResult<Migration> {
    let migration = store
        .get(&change.location)?
        .ok_or_else(|| MigrationError::ScriptMissing {
            location: change.location.clone(),
        })?;
    if migration.checksum != change.checksum {
        return Err(MigrationError::script_changed(
            change.location.clone(),
            change.checksum.clone(),
            migration.checksum.clone(),
        ));
    }
    if !migration.script.is_reversible() {
        return Err(MigrationError::NotReversible {
            location: change.location.clone(),
        });
    }
    Ok(migration)
}

/// Reverse one previously recorded change
pub(crate) struct RevertChange {
    change: Change,
    label: String,
}

impl RevertChange {
    pub fn new(change: Change) -> Self {
        let label = format!("rollback {}", change.location);
        Self { change, label }
    }
}

impl<'c> Task<DeployContext<'c>> for RevertChange {
    fn name(&self) -> &str {
        &self.label
    }

    fn description(&self) -> String {
        format!("{} (deployed by {})", self.change.location, self.change.deployment_tag)
    }

    fn run(&mut self, ctx: &mut DeployContext<'c>) -> MigrationResult<()> {
        let migration = reversible_migration(ctx.store, &self.change)?;

        let start = Instant::now();
        let before = ctx
            .env
            .with_change(&ctx.provisional(&migration, ChangeStatus::Rollbacked));
        ctx.fire(HookEvent::before_each(ctx.command), &before)?;

        let script = migration.script.clone();
        let change = ctx.apply_and_record(&migration, ChangeStatus::Rollbacked, |session| {
            script
                .rollback(session.as_session_mut())
                .map_err(|e| script_failed(&migration, e))
        })?;

        let after = ctx.env.with_change(&change);
        ctx.fire(HookEvent::after_each(ctx.command), &after)?;

        info!(location = %migration.location, "rolled back migration");
        ctx.report.entries.push(ReportEntry {
            location: migration.location.clone(),
            action: EntryAction::Rollback,
            checksum: migration.checksum.clone(),
            detail: None,
            elapsed_ms: elapsed_ms(start),
        });
        Ok(())
    }
}
