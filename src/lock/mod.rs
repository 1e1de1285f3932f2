//! # Session Lock Manager
//!
//! Application-level mutual exclusion between deployment units that target
//! the same history schema. Each platform supplies its own primitive:
//!
//! - **Advisory**: a server-side named lock held by the session
//! - **File**: an exclusive lock on a file next to the database, for
//!   platforms without a server-side primitive
//!
//! `acquire` polls until it succeeds or the timeout elapses; an ordinary
//! timeout is `Ok(false)`, never an error.

pub mod advisory;
pub mod file;

pub use advisory::{AdvisoryLock, AdvisoryPrimitive};
pub use file::FileLock;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::migrations::MigrationResult;

/// Default delay between two acquisition attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Named mutual-exclusion lock
pub trait Lock: Send {
    /// Try to take `name` until `timeout` elapses. `Ok(false)` on timeout.
    fn acquire(&mut self, name: &str, timeout: Duration) -> MigrationResult<bool>;

    /// Give `name` back. Releasing a name that is not held is a no-op.
    fn release(&mut self, name: &str) -> MigrationResult<()>;

    fn is_held(&self, name: &str) -> bool;
}

/// Locking primitive offered by a session
#[derive(Clone)]
pub enum LockStrategy {
    /// Server-side named lock
    Advisory(Arc<dyn AdvisoryPrimitive>),
    /// Lock files under a directory
    File { dir: PathBuf },
}

impl fmt::Debug for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStrategy::Advisory(_) => f.write_str("Advisory"),
            LockStrategy::File { dir } => f.debug_struct("File").field("dir", dir).finish(),
        }
    }
}

/// Build the lock implementation for a strategy
pub fn create(strategy: LockStrategy, poll_interval: Duration) -> Box<dyn Lock> {
    let poll_interval = clamp_poll_interval(poll_interval);
    match strategy {
        LockStrategy::Advisory(primitive) => Box::new(AdvisoryLock::new(primitive, poll_interval)),
        LockStrategy::File { dir } => Box::new(FileLock::new(dir, poll_interval)),
    }
}

/// Keep the poll interval between 10ms and 500ms
pub fn clamp_poll_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// Retry `attempt` every `interval` until it returns true or `timeout` elapses
pub(crate) fn poll_until<F>(timeout: Duration, interval: Duration, mut attempt: F) -> MigrationResult<bool>
where
    F: FnMut() -> MigrationResult<bool>,
{
    let start = Instant::now();
    loop {
        if attempt()? {
            return Ok(true);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(false);
        }
        thread::sleep(interval.min(timeout - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_clamp_poll_interval() {
        assert_eq!(clamp_poll_interval(Duration::from_millis(1)), MIN_POLL_INTERVAL);
        assert_eq!(clamp_poll_interval(Duration::from_secs(5)), MAX_POLL_INTERVAL);
        assert_eq!(
            clamp_poll_interval(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_poll_until_succeeds_after_retries() {
        let attempts = Cell::new(0);
        let acquired = poll_until(Duration::from_secs(1), Duration::from_millis(10), || {
            attempts.set(attempts.get() + 1);
            Ok(attempts.get() == 3)
        })
        .unwrap();
        assert!(acquired);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_poll_until_times_out() {
        let start = Instant::now();
        let acquired =
            poll_until(Duration::from_millis(60), Duration::from_millis(10), || Ok(false)).unwrap();
        assert!(!acquired);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_zero_timeout_tries_once() {
        let attempts = Cell::new(0);
        let acquired = poll_until(Duration::ZERO, Duration::from_millis(10), || {
            attempts.set(attempts.get() + 1);
            Ok(false)
        })
        .unwrap();
        assert!(!acquired);
        assert_eq!(attempts.get(), 1);
    }
}
