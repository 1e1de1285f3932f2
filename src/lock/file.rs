//! Exclusive file locks for platforms without a server-side primitive.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{poll_until, Lock};
use crate::migrations::{MigrationError, MigrationResult};

/// Who holds a lock file, written after acquisition for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub user: String,
    pub acquired_at: DateTime<Utc>,
}

/// Lock files `<dir>/<name>.lock`
pub struct FileLock {
    dir: PathBuf,
    poll_interval: Duration,
    held: HashMap<String, File>,
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            held: HashMap::new(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    /// Current holder recorded in the lock file, if any
    pub fn holder(&self, name: &str) -> MigrationResult<Option<LockHolder>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| MigrationError::io(&path, e))?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&content).ok())
    }

    fn open(path: &Path) -> MigrationResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| MigrationError::io(path, e))
    }

    fn try_lock(file: &File, name: &str) -> MigrationResult<bool> {
        match file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(e) if is_contended(&e) => Ok(false),
            Err(e) => Err(MigrationError::Lock {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn record_holder(file: &mut File) -> io::Result<()> {
        let holder = LockHolder {
            pid: std::process::id(),
            user: whoami::username(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&holder).unwrap_or_default();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(json.as_bytes())?;
        file.flush()
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Lock for FileLock {
    fn acquire(&mut self, name: &str, timeout: Duration) -> MigrationResult<bool> {
        if self.held.contains_key(name) {
            error!(lock = name, "file lock acquired again while already held");
            return Ok(true);
        }

        fs::create_dir_all(&self.dir).map_err(|e| MigrationError::io(&self.dir, e))?;
        let path = self.path_for(name);
        let mut file = Self::open(&path)?;

        let acquired = poll_until(timeout, self.poll_interval, || Self::try_lock(&file, name))?;
        if !acquired {
            warn!(lock = name, path = %path.display(), "file lock timed out");
            return Ok(false);
        }

        if let Err(e) = Self::record_holder(&mut file) {
            warn!(lock = name, error = %e, "could not record lock holder");
        }
        debug!(lock = name, path = %path.display(), "acquired file lock");
        self.held.insert(name.to_string(), file);
        Ok(true)
    }

    fn release(&mut self, name: &str) -> MigrationResult<()> {
        let file = match self.held.remove(name) {
            Some(file) => file,
            None => {
                warn!(lock = name, "release of file lock that is not held");
                return Ok(());
            }
        };
        if let Err(e) = file.set_len(0) {
            warn!(lock = name, error = %e, "could not clear lock holder");
        }
        file.unlock().map_err(|e| MigrationError::Lock {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        debug!(lock = name, "released file lock");
        Ok(())
    }

    fn is_held(&self, name: &str) -> bool {
        self.held.contains_key(name)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        for (name, file) in self.held.drain() {
            if let Err(e) = file.unlock() {
                warn!(lock = %name, error = %e, "failed to release file lock on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_holder() {
        let temp = TempDir::new().unwrap();
        let mut lock = FileLock::new(temp.path(), Duration::from_millis(10));

        assert!(lock.acquire("hist", Duration::from_millis(100)).unwrap());
        let holder = lock.holder("hist").unwrap().unwrap();
        assert_eq!(holder.pid, std::process::id());

        lock.release("hist").unwrap();
        assert!(lock.holder("hist").unwrap().is_none());
    }

    #[test]
    fn test_exclusive_between_instances() {
        let temp = TempDir::new().unwrap();
        let mut first = FileLock::new(temp.path(), Duration::from_millis(10));
        let mut second = FileLock::new(temp.path(), Duration::from_millis(10));

        assert!(first.acquire("hist", Duration::from_millis(100)).unwrap());
        assert!(!second.acquire("hist", Duration::from_millis(100)).unwrap());

        first.release("hist").unwrap();
        assert!(second.acquire("hist", Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_concurrent_acquire_exactly_one_wins() {
        let temp = TempDir::new().unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let dir = temp.path().to_path_buf();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut lock = FileLock::new(dir, Duration::from_millis(10));
                    barrier.wait();
                    let acquired = lock.acquire("hist", Duration::from_millis(200)).unwrap();
                    // hold past the other caller's timeout
                    thread::sleep(Duration::from_millis(400));
                    acquired
                })
            })
            .collect();

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| **r).count(), 1);
    }

    #[test]
    fn test_reentrant_acquire_returns_immediately() {
        let temp = TempDir::new().unwrap();
        let mut lock = FileLock::new(temp.path(), Duration::from_millis(10));

        assert!(lock.acquire("hist", Duration::from_millis(100)).unwrap());
        let start = Instant::now();
        assert!(lock.acquire("hist", Duration::from_secs(5)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_release_unheld_is_noop() {
        let temp = TempDir::new().unwrap();
        let mut lock = FileLock::new(temp.path(), Duration::from_millis(10));
        assert!(lock.release("never").is_ok());
    }
}
