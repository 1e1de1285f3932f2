//! Server-side advisory locks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::{poll_until, Lock};
use crate::migrations::MigrationResult;

/// Non-blocking named lock offered by a database server
///
/// Ownership belongs to the primitive instance: two sessions hold two
/// primitives, and only one of them can own a given key.
pub trait AdvisoryPrimitive: Send + Sync {
    /// Take `key` if free. Never blocks.
    fn try_lock(&self, key: &str) -> MigrationResult<bool>;

    fn unlock(&self, key: &str) -> MigrationResult<()>;
}

/// Poll-based lock over an [`AdvisoryPrimitive`]
pub struct AdvisoryLock {
    primitive: Arc<dyn AdvisoryPrimitive>,
    poll_interval: Duration,
    held: HashSet<String>,
}

impl AdvisoryLock {
    pub fn new(primitive: Arc<dyn AdvisoryPrimitive>, poll_interval: Duration) -> Self {
        Self {
            primitive,
            poll_interval,
            held: HashSet::new(),
        }
    }
}

impl Lock for AdvisoryLock {
    fn acquire(&mut self, name: &str, timeout: Duration) -> MigrationResult<bool> {
        if self.held.contains(name) {
            error!(lock = name, "advisory lock acquired again while already held");
            return Ok(true);
        }

        let primitive = Arc::clone(&self.primitive);
        let acquired = poll_until(timeout, self.poll_interval, || primitive.try_lock(name))?;
        if acquired {
            debug!(lock = name, "acquired advisory lock");
            self.held.insert(name.to_string());
        } else {
            warn!(lock = name, timeout_ms = timeout.as_millis() as u64, "advisory lock timed out");
        }
        Ok(acquired)
    }

    fn release(&mut self, name: &str) -> MigrationResult<()> {
        if !self.held.remove(name) {
            warn!(lock = name, "release of advisory lock that is not held");
            return Ok(());
        }
        self.primitive.unlock(name)?;
        debug!(lock = name, "released advisory lock");
        Ok(())
    }

    fn is_held(&self, name: &str) -> bool {
        self.held.contains(name)
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        for name in self.held.drain() {
            if let Err(e) = self.primitive.unlock(&name) {
                warn!(lock = %name, error = %e, "failed to release advisory lock on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::memory::MemoryServer;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn lock_for(server: &MemoryServer) -> AdvisoryLock {
        AdvisoryLock::new(server.advisory(), Duration::from_millis(10))
    }

    #[test]
    fn test_acquire_and_release() {
        let server = MemoryServer::new();
        let mut lock = lock_for(&server);

        assert!(lock.acquire("hist", Duration::from_millis(50)).unwrap());
        assert!(lock.is_held("hist"));
        lock.release("hist").unwrap();
        assert!(!lock.is_held("hist"));
    }

    #[test]
    fn test_second_holder_times_out() {
        let server = MemoryServer::new();
        let mut first = lock_for(&server);
        let mut second = lock_for(&server);

        assert!(first.acquire("hist", Duration::from_millis(50)).unwrap());
        assert!(!second.acquire("hist", Duration::from_millis(50)).unwrap());
        assert!(second.acquire("other", Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn test_reentrant_acquire_does_not_deadlock() {
        let server = MemoryServer::new();
        let mut lock = lock_for(&server);

        assert!(lock.acquire("hist", Duration::from_millis(50)).unwrap());
        let start = Instant::now();
        assert!(lock.acquire("hist", Duration::from_secs(5)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_second_succeeds_only_after_release() {
        let server = MemoryServer::new();
        let mut first = lock_for(&server);
        assert!(first.acquire("hist", Duration::from_millis(50)).unwrap());

        let (tx, rx) = mpsc::channel();
        let contender = server.clone();
        let handle = thread::spawn(move || {
            let mut second = lock_for(&contender);
            let acquired = second.acquire("hist", Duration::from_secs(5)).unwrap();
            tx.send(Instant::now()).unwrap();
            acquired
        });

        thread::sleep(Duration::from_millis(100));
        let released_at = Instant::now();
        first.release("hist").unwrap();

        assert!(handle.join().unwrap());
        assert!(rx.recv().unwrap() >= released_at);
    }

    #[test]
    fn test_drop_releases() {
        let server = MemoryServer::new();
        {
            let mut lock = lock_for(&server);
            assert!(lock.acquire("hist", Duration::from_millis(50)).unwrap());
        }
        let mut other = lock_for(&server);
        assert!(other.acquire("hist", Duration::from_millis(50)).unwrap());
    }
}
