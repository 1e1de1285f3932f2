//! # Task Log
//!
//! Append-only record of task lifecycle events for one CLI run. Entries are
//! never modified; once the log is full the oldest entry is evicted.
//!
//! The log is a cheap `Clone` handle so one copy can be handed to the
//! coordinator as its observer while another is read afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::{TaskEvent, TaskObserver};

/// Default number of entries kept
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// One recorded event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskLogEntry {
    /// Position in the run, starting at 0; keeps counting after eviction
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TaskEvent,
}

#[derive(Debug)]
struct Inner {
    max_entries: usize,
    next_seq: u64,
    entries: VecDeque<TaskLogEntry>,
}

/// Bounded, shared task event log
#[derive(Debug, Clone)]
pub struct TaskLog {
    inner: Arc<RwLock<Inner>>,
}

impl TaskLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Log keeping at most `max_entries` (at least one)
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                max_entries: max_entries.max(1),
                next_seq: 0,
                entries: VecDeque::new(),
            })),
        }
    }

    /// Append an event
    pub fn record(&self, event: TaskEvent) {
        if let Ok(mut inner) = self.inner.write() {
            while inner.entries.len() >= inner.max_entries {
                inner.entries.pop_front();
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.push_back(TaskLogEntry {
                seq,
                recorded_at: Utc::now(),
                event,
            });
        }
    }

    pub fn entries(&self) -> Vec<TaskLogEntry> {
        self.inner
            .read()
            .map(|inner| inner.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tasks that finished unsuccessfully
    pub fn failures(&self) -> Vec<TaskLogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| matches!(entry.event, TaskEvent::Finished { success: false, .. }))
            .collect()
    }

    /// Names of the compensated tasks, in unwind order
    pub fn compensated(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| matches!(entry.event, TaskEvent::Compensated { .. }))
            .map(|entry| entry.event.name().to_string())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl Default for TaskLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskObserver for TaskLog {
    fn on_event(&mut self, event: &TaskEvent) {
        self.record(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn started(name: &str) -> TaskEvent {
        TaskEvent::Started {
            name: name.to_string(),
            description: name.to_string(),
        }
    }

    #[test]
    fn test_append_only_order() {
        let log = TaskLog::new();
        log.record(started("lock"));
        log.record(TaskEvent::Finished {
            name: "lock".to_string(),
            description: "lock".to_string(),
            elapsed: Duration::from_millis(3),
            success: true,
        });

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[1].seq, 1);
        assert!(log.failures().is_empty());
    }

    #[test]
    fn test_bounded_eviction_keeps_sequence() {
        let log = TaskLog::with_capacity(2);
        for name in ["a", "b", "c"] {
            log.record(started(name));
        }

        let entries = log.entries();
        assert_eq!(log.count(), 2);
        assert_eq!(entries[0].event.name(), "b");
        assert_eq!(entries[1].seq, 2);
    }

    #[test]
    fn test_shared_handle_as_observer() {
        let log = TaskLog::new();
        let mut observer = log.clone();
        observer.on_event(&TaskEvent::Compensated {
            name: "open-deployment".to_string(),
            success: true,
        });
        observer.on_event(&TaskEvent::Finished {
            name: "apply".to_string(),
            description: "apply a.yaml".to_string(),
            elapsed: Duration::ZERO,
            success: false,
        });

        assert_eq!(log.compensated(), vec!["open-deployment"]);
        assert_eq!(log.failures().len(), 1);
    }

    #[test]
    fn test_entry_serializes_flat() {
        let log = TaskLog::new();
        log.record(started("lock"));
        let value = serde_json::to_value(&log.entries()[0]).unwrap();
        assert_eq!(value["event"], "started");
        assert_eq!(value["name"], "lock");
    }
}
