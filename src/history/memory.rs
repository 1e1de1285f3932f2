//! In-memory database server.
//!
//! A [`MemoryServer`] is a shared, transactional store that any number of
//! [`MemorySession`]s connect to. Sessions see committed state unless they
//! have an open transaction, in which case reads and writes go to a private
//! snapshot. Each write is also logged, and commit replays the log onto the
//! committed state, so concurrent sessions keep what they committed.
//!
//! The server also owns named advisory locks. A lock belongs to the session
//! (or primitive) that took it and is dropped with that session.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Change, Deployment, HistoryStore, LedgerTable};
use crate::lock::{AdvisoryPrimitive, LockStrategy};
use crate::migrations::{same_location, ErrorDetails, MigrationError, MigrationResult};
use crate::session::{Platform, Session};

#[derive(Debug, Clone, Default)]
struct MemoryLedger {
    tables: BTreeSet<LedgerTable>,
    version: Option<u32>,
    deployments: Vec<Deployment>,
    changes: Vec<Change>,
}

#[derive(Debug, Clone, Default)]
struct MemoryData {
    ledgers: HashMap<String, MemoryLedger>,
    statements: Vec<String>,
}

/// One logged write, replayable onto any state
#[derive(Debug, Clone)]
enum WriteOp {
    Execute(Vec<String>),
    InstallLedger {
        schema: String,
        version: u32,
    },
    InsertDeployment {
        schema: String,
        deployment: Deployment,
    },
    CloseDeployment {
        schema: String,
        tag: String,
        ended_at: DateTime<Utc>,
        error: Option<ErrorDetails>,
    },
    InsertChange {
        schema: String,
        change: Change,
    },
}

impl WriteOp {
    fn apply(&self, data: &mut MemoryData) -> MigrationResult<()> {
        match self {
            WriteOp::Execute(statements) => {
                data.statements.extend(statements.iter().cloned());
            }
            WriteOp::InstallLedger { schema, version } => {
                let ledger = data.ledgers.entry(schema.clone()).or_default();
                ledger.tables.extend(LedgerTable::ALL);
                ledger.version = Some(*version);
            }
            WriteOp::InsertDeployment { schema, deployment } => {
                let ledger = MemorySession::ledger_mut(data, schema)?;
                if ledger.deployments.iter().any(|d| d.tag == deployment.tag) {
                    return Err(MigrationError::DuplicateTag(deployment.tag.clone()));
                }
                ledger.deployments.push(deployment.clone());
            }
            WriteOp::CloseDeployment {
                schema,
                tag,
                ended_at,
                error,
            } => {
                let ledger = MemorySession::ledger_mut(data, schema)?;
                let deployment = ledger
                    .deployments
                    .iter_mut()
                    .find(|d| &d.tag == tag)
                    .ok_or_else(|| MigrationError::DeploymentNotFound(tag.clone()))?;
                if deployment.ended_at.is_some() {
                    return Err(MigrationError::ledger(format!("deployment '{}' is already closed", tag)));
                }
                deployment.ended_at = Some(*ended_at);
                deployment.error = error.clone();
            }
            WriteOp::InsertChange { schema, change } => {
                let ledger = MemorySession::ledger_mut(data, schema)?;
                if !ledger.deployments.iter().any(|d| d.tag == change.deployment_tag) {
                    return Err(MigrationError::DeploymentNotFound(change.deployment_tag.clone()));
                }
                ledger.changes.push(change.clone());
            }
        }
        Ok(())
    }
}

/// Open transaction: a private snapshot plus the writes made on it
#[derive(Debug)]
struct Transaction {
    snapshot: MemoryData,
    log: Vec<WriteOp>,
}

#[derive(Debug, Default)]
struct ServerState {
    data: MemoryData,
    locks: HashMap<String, u64>,
    reject: Vec<String>,
}

/// Shared in-memory server
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    next_owner: Arc<AtomicU64>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MigrationResult<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| MigrationError::internal("memory server state poisoned"))
    }

    fn next_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Committed statements, in execution order
    pub fn statements(&self) -> MigrationResult<Vec<String>> {
        Ok(self.lock_state()?.data.statements.clone())
    }

    /// Make every statement containing `pattern` fail
    pub fn reject_statements_containing(&self, pattern: &str) -> MigrationResult<()> {
        self.lock_state()?.reject.push(pattern.to_string());
        Ok(())
    }

    /// Drop one ledger table, leaving the ledger partially installed
    pub fn drop_ledger_table(&self, schema: &str, table: LedgerTable) -> MigrationResult<()> {
        if let Some(ledger) = self.lock_state()?.data.ledgers.get_mut(schema) {
            ledger.tables.remove(&table);
        }
        Ok(())
    }

    /// Advisory primitive with its own owner identity
    pub fn advisory(&self) -> Arc<dyn AdvisoryPrimitive> {
        Arc::new(MemoryAdvisory {
            server: self.clone(),
            owner: self.next_owner(),
        })
    }

    fn release_owner(&self, owner: u64) -> MigrationResult<()> {
        self.lock_state()?.locks.retain(|_, held_by| *held_by != owner);
        Ok(())
    }
}

struct MemoryAdvisory {
    server: MemoryServer,
    owner: u64,
}

impl AdvisoryPrimitive for MemoryAdvisory {
    fn try_lock(&self, key: &str) -> MigrationResult<bool> {
        let mut state = self.server.lock_state()?;
        match state.locks.get(key) {
            Some(owner) => Ok(*owner == self.owner),
            None => {
                state.locks.insert(key.to_string(), self.owner);
                Ok(true)
            }
        }
    }

    fn unlock(&self, key: &str) -> MigrationResult<()> {
        let mut state = self.server.lock_state()?;
        if state.locks.get(key) == Some(&self.owner) {
            state.locks.remove(key);
        }
        Ok(())
    }
}

/// Connection to a [`MemoryServer`]
pub struct MemorySession {
    id: u64,
    server: MemoryServer,
    txn: Option<Transaction>,
}

impl MemorySession {
    pub fn connect(server: &MemoryServer) -> Self {
        let id = server.next_owner();
        debug!(session = id, "connected to memory server");
        Self {
            id,
            server: server.clone(),
            txn: None,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryData) -> T) -> MigrationResult<T> {
        match &self.txn {
            Some(txn) => Ok(f(&txn.snapshot)),
            None => Ok(f(&self.server.lock_state()?.data)),
        }
    }

    fn write(&mut self, op: WriteOp) -> MigrationResult<()> {
        match &mut self.txn {
            Some(txn) => {
                op.apply(&mut txn.snapshot)?;
                txn.log.push(op);
                Ok(())
            }
            None => {
                let mut state = self.server.lock_state()?;
                // autocommit: apply to a copy so a failed write leaves no trace
                let mut data = state.data.clone();
                op.apply(&mut data)?;
                state.data = data;
                Ok(())
            }
        }
    }

    fn ledger<'a>(data: &'a MemoryData, schema: &str) -> MigrationResult<&'a MemoryLedger> {
        data.ledgers
            .get(schema)
            .filter(|ledger| LedgerTable::ALL.iter().all(|t| ledger.tables.contains(t)))
            .ok_or_else(|| MigrationError::ledger(format!("history ledger '{}' is not installed", schema)))
    }

    fn ledger_mut<'a>(data: &'a mut MemoryData, schema: &str) -> MigrationResult<&'a mut MemoryLedger> {
        data.ledgers
            .get_mut(schema)
            .filter(|ledger| LedgerTable::ALL.iter().all(|t| ledger.tables.contains(t)))
            .ok_or_else(|| MigrationError::ledger(format!("history ledger '{}' is not installed", schema)))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Err(e) = self.server.release_owner(self.id) {
            warn!(session = self.id, error = %e, "failed to release session locks");
        }
    }
}

impl Session for MemorySession {
    fn platform(&self) -> Platform {
        Platform::Memory
    }

    fn begin(&mut self) -> MigrationResult<()> {
        if self.txn.is_some() {
            return Err(MigrationError::Transaction {
                action: "begin",
                message: "transaction already open".to_string(),
            });
        }
        let snapshot = self.server.lock_state()?.data.clone();
        self.txn = Some(Transaction {
            snapshot,
            log: Vec::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> MigrationResult<()> {
        let txn = self.txn.take().ok_or_else(|| MigrationError::Transaction {
            action: "commit",
            message: "no open transaction".to_string(),
        })?;
        let mut state = self.server.lock_state()?;
        let mut data = state.data.clone();
        for op in &txn.log {
            op.apply(&mut data).map_err(|e| MigrationError::Transaction {
                action: "commit",
                message: format!("conflicts with a concurrent write: {}", e),
            })?;
        }
        state.data = data;
        debug!(session = self.id, writes = txn.log.len(), "committed transaction");
        Ok(())
    }

    fn rollback(&mut self) -> MigrationResult<()> {
        if self.txn.take().is_none() {
            return Err(MigrationError::Transaction {
                action: "rollback",
                message: "no open transaction".to_string(),
            });
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn execute(&mut self, sql: &str) -> MigrationResult<()> {
        let reject = self.server.lock_state()?.reject.clone();
        let mut statements = Vec::new();
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(pattern) = reject.iter().find(|p| statement.contains(p.as_str())) {
                return Err(MigrationError::statement_failed(format!(
                    "statement rejected by server (matches '{}'): {}",
                    pattern, statement
                )));
            }
            statements.push(statement.to_string());
        }
        self.write(WriteOp::Execute(statements))
    }

    fn lock_strategy(&self) -> LockStrategy {
        LockStrategy::Advisory(Arc::new(MemoryAdvisory {
            server: self.server.clone(),
            owner: self.id,
        }))
    }
}

impl HistoryStore for MemorySession {
    fn ledger_tables(&self, schema: &str) -> MigrationResult<Vec<LedgerTable>> {
        self.read(|data| {
            data.ledgers
                .get(schema)
                .map(|ledger| ledger.tables.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    fn ledger_version(&self, schema: &str) -> MigrationResult<Option<u32>> {
        self.read(|data| data.ledgers.get(schema).and_then(|ledger| ledger.version))
    }

    fn install_ledger(
        &mut self,
        schema: &str,
        version: u32,
        _installed_at: DateTime<Utc>,
    ) -> MigrationResult<()> {
        self.write(WriteOp::InstallLedger {
            schema: schema.to_string(),
            version,
        })
    }

    fn insert_deployment(&mut self, schema: &str, deployment: &Deployment) -> MigrationResult<()> {
        self.write(WriteOp::InsertDeployment {
            schema: schema.to_string(),
            deployment: deployment.clone(),
        })
    }

    fn close_deployment(
        &mut self,
        schema: &str,
        tag: &str,
        ended_at: DateTime<Utc>,
        error: Option<&ErrorDetails>,
    ) -> MigrationResult<()> {
        self.write(WriteOp::CloseDeployment {
            schema: schema.to_string(),
            tag: tag.to_string(),
            ended_at,
            error: error.cloned(),
        })
    }

    fn insert_change(&mut self, schema: &str, change: &Change) -> MigrationResult<()> {
        self.write(WriteOp::InsertChange {
            schema: schema.to_string(),
            change: change.clone(),
        })
    }

    fn find_deployment(&self, schema: &str, tag: &str) -> MigrationResult<Option<Deployment>> {
        self.read(|data| {
            Self::ledger(data, schema)
                .map(|ledger| ledger.deployments.iter().find(|d| d.tag == tag).cloned())
        })?
    }

    fn latest_change(&self, schema: &str, location: &str) -> MigrationResult<Option<Change>> {
        self.read(|data| {
            Self::ledger(data, schema).map(|ledger| {
                ledger
                    .changes
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| same_location(&c.location, location))
                    .max_by_key(|(i, c)| (c.deployed_at, *i))
                    .map(|(_, c)| c.clone())
            })
        })?
    }

    fn latest_changes(&self, schema: &str) -> MigrationResult<Vec<Change>> {
        self.read(|data| {
            Self::ledger(data, schema).map(|ledger| {
                let mut latest: Vec<(usize, &Change)> = Vec::new();
                for (i, change) in ledger.changes.iter().enumerate() {
                    match latest
                        .iter_mut()
                        .find(|(_, c)| same_location(&c.location, &change.location))
                    {
                        Some(slot) => {
                            if (change.deployed_at, i) > (slot.1.deployed_at, slot.0) {
                                *slot = (i, change);
                            }
                        }
                        None => latest.push((i, change)),
                    }
                }
                latest.sort_by(|a, b| (b.1.deployed_at, b.0).cmp(&(a.1.deployed_at, a.0)));
                latest.into_iter().map(|(_, c)| c.clone()).collect()
            })
        })?
    }

    fn changes_for_tag(&self, schema: &str, tag: &str) -> MigrationResult<Vec<Change>> {
        self.read(|data| {
            Self::ledger(data, schema).map(|ledger| {
                let mut changes: Vec<Change> = ledger
                    .changes
                    .iter()
                    .filter(|c| c.deployment_tag == tag)
                    .cloned()
                    .collect();
                changes.sort_by_key(|c| c.deployed_at);
                changes
            })
        })?
    }

    fn max_deployed_at(&self, schema: &str) -> MigrationResult<Option<DateTime<Utc>>> {
        self.read(|data| {
            Self::ledger(data, schema)
                .map(|ledger| ledger.changes.iter().map(|c| c.deployed_at).max())
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ChangeStatus, Command, LEDGER_SCHEMA_VERSION};
    use crate::migrations::MigratePolicy;
    use chrono::Duration;

    fn deployment(tag: &str, started_at: DateTime<Utc>) -> Deployment {
        Deployment {
            tag: tag.to_string(),
            command: Command::Migrate,
            deployer: "me".to_string(),
            application: "app".to_string(),
            schema_version: LEDGER_SCHEMA_VERSION,
            started_at,
            ended_at: None,
            error: None,
        }
    }

    fn change(location: &str, tag: &str, status: ChangeStatus, deployed_at: DateTime<Utc>) -> Change {
        Change {
            location: location.to_string(),
            deployment_tag: tag.to_string(),
            migrate_policy: MigratePolicy::Once,
            status,
            author: String::new(),
            checksum: "sha256:00".to_string(),
            description: String::new(),
            authored_at: None,
            deployed_at,
        }
    }

    fn installed() -> (MemoryServer, MemorySession) {
        let server = MemoryServer::new();
        let mut session = MemorySession::connect(&server);
        session
            .install_ledger("hist", LEDGER_SCHEMA_VERSION, Utc::now())
            .unwrap();
        (server, session)
    }

    #[test]
    fn test_transaction_isolation() {
        let (server, mut writer) = installed();
        let reader = MemorySession::connect(&server);

        writer.begin().unwrap();
        writer.execute("CREATE TABLE a (id INT); INSERT INTO a VALUES (1)").unwrap();
        writer.insert_deployment("hist", &deployment("t1", Utc::now())).unwrap();

        assert!(reader.find_deployment("hist", "t1").unwrap().is_none());
        assert!(server.statements().unwrap().is_empty());

        writer.commit().unwrap();
        assert!(reader.find_deployment("hist", "t1").unwrap().is_some());
        assert_eq!(server.statements().unwrap().len(), 2);
    }

    #[test]
    fn test_commit_keeps_concurrent_writes() {
        let server = MemoryServer::new();
        let mut a = MemorySession::connect(&server);
        let mut b = MemorySession::connect(&server);
        a.install_ledger("s1", LEDGER_SCHEMA_VERSION, Utc::now()).unwrap();

        a.begin().unwrap();
        a.insert_deployment("s1", &deployment("a1", Utc::now())).unwrap();
        b.install_ledger("s2", LEDGER_SCHEMA_VERSION, Utc::now()).unwrap();
        b.insert_deployment("s2", &deployment("x", Utc::now())).unwrap();
        a.commit().unwrap();

        assert_eq!(b.ledger_tables("s2").unwrap().len(), 3);
        assert!(b.find_deployment("s2", "x").unwrap().is_some());
        assert!(b.find_deployment("s1", "a1").unwrap().is_some());
    }

    #[test]
    fn test_conflicting_commit_is_refused() {
        let (server, mut a) = installed();
        let mut b = MemorySession::connect(&server);

        a.begin().unwrap();
        a.execute("CREATE TABLE a (id INT)").unwrap();
        a.insert_deployment("hist", &deployment("t1", Utc::now())).unwrap();
        b.insert_deployment("hist", &deployment("t1", Utc::now())).unwrap();

        let err = a.commit().unwrap_err();
        assert!(matches!(err, MigrationError::Transaction { action: "commit", .. }));
        assert!(!a.in_transaction());
        assert!(server.statements().unwrap().is_empty());
        assert!(b.find_deployment("hist", "t1").unwrap().is_some());
    }

    #[test]
    fn test_rollback_discards() {
        let (server, mut session) = installed();
        session.begin().unwrap();
        session.execute("CREATE TABLE a (id INT)").unwrap();
        session.rollback().unwrap();

        assert!(!session.in_transaction());
        assert!(server.statements().unwrap().is_empty());
        assert!(session.rollback().is_err());
    }

    #[test]
    fn test_rejected_statement() {
        let (server, mut session) = installed();
        server.reject_statements_containing("boom").unwrap();

        session.execute("SELECT 1").unwrap();
        assert!(session.execute("SELECT 2; SELECT boom").is_err());
        assert_eq!(server.statements().unwrap(), vec!["SELECT 1".to_string()]);
    }

    #[test]
    fn test_latest_changes_one_per_location() {
        let (_server, mut session) = installed();
        let t0 = Utc::now();
        session.insert_deployment("hist", &deployment("t1", t0)).unwrap();
        session
            .insert_change("hist", &change("a.yaml", "t1", ChangeStatus::Migrated, t0))
            .unwrap();
        session
            .insert_change("hist", &change("b.yaml", "t1", ChangeStatus::Migrated, t0 + Duration::seconds(1)))
            .unwrap();
        session
            .insert_change("hist", &change("A.yaml", "t1", ChangeStatus::Remigrated, t0 + Duration::seconds(2)))
            .unwrap();

        let latest = session.latest_changes("hist").unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].location, "A.yaml");
        assert_eq!(latest[0].status, ChangeStatus::Remigrated);
        assert_eq!(latest[1].location, "b.yaml");
    }

    #[test]
    fn test_close_exactly_once() {
        let (_server, mut session) = installed();
        session.insert_deployment("hist", &deployment("t1", Utc::now())).unwrap();
        session.close_deployment("hist", "t1", Utc::now(), None).unwrap();
        assert!(session.close_deployment("hist", "t1", Utc::now(), None).is_err());
        assert!(matches!(
            session.close_deployment("hist", "nope", Utc::now(), None),
            Err(MigrationError::DeploymentNotFound(_))
        ));
    }

    #[test]
    fn test_change_requires_deployment() {
        let (_server, mut session) = installed();
        let orphan = change("a.yaml", "ghost", ChangeStatus::Migrated, Utc::now());
        assert!(session.insert_change("hist", &orphan).is_err());
    }

    #[test]
    fn test_session_drop_releases_advisory_locks() {
        let server = MemoryServer::new();
        let session = MemorySession::connect(&server);
        let primitive = match session.lock_strategy() {
            LockStrategy::Advisory(primitive) => primitive,
            other => panic!("unexpected strategy {:?}", other),
        };
        assert!(primitive.try_lock("hist").unwrap());
        assert!(!server.advisory().try_lock("hist").unwrap());

        drop(primitive);
        drop(session);
        assert!(server.advisory().try_lock("hist").unwrap());
    }
}
