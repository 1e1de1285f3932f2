//! # Task/Undo Framework
//!
//! Runs reversible steps in order. When a step fails, every step that
//! already succeeded is compensated in reverse order, and the original
//! failure is returned to the caller. Compensation failures are logged and
//! swallowed one by one so they never mask the error that started the
//! unwind.
//!
//! Each step reports a start and a finish event to the observer given at
//! construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::migrations::{MigrationError, MigrationResult};

/// One reversible step operating on a context `C`
pub trait Task<C: ?Sized> {
    fn name(&self) -> &str;

    fn description(&self) -> String {
        self.name().to_string()
    }

    fn run(&mut self, ctx: &mut C) -> MigrationResult<()>;

    /// Undo a successful `run` after a later step failed with `cause`
    fn compensate(&mut self, _ctx: &mut C, _cause: &MigrationError) -> MigrationResult<()> {
        Ok(())
    }
}

/// Lifecycle event of a task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        name: String,
        description: String,
    },
    Finished {
        name: String,
        description: String,
        elapsed: Duration,
        success: bool,
    },
    Compensated {
        name: String,
        success: bool,
    },
}

impl TaskEvent {
    pub fn name(&self) -> &str {
        match self {
            TaskEvent::Started { name, .. }
            | TaskEvent::Finished { name, .. }
            | TaskEvent::Compensated { name, .. } => name,
        }
    }
}

/// Receives task lifecycle events
pub trait TaskObserver {
    fn on_event(&mut self, event: &TaskEvent);
}

impl<F: FnMut(&TaskEvent)> TaskObserver for F {
    fn on_event(&mut self, event: &TaskEvent) {
        self(event)
    }
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TaskObserver for NullObserver {
    fn on_event(&mut self, _event: &TaskEvent) {}
}

/// Sequential runner with LIFO compensation
pub struct TaskRunner<'a, C: ?Sized> {
    completed: Vec<Box<dyn Task<C> + 'a>>,
    observer: &'a mut dyn TaskObserver,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a, C: ?Sized> TaskRunner<'a, C> {
    pub fn new(observer: &'a mut dyn TaskObserver) -> Self {
        Self {
            completed: Vec::new(),
            observer,
            interrupt: None,
        }
    }

    /// Refuse to start further tasks once `flag` is set
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Run one task. On failure the runner unwinds before returning.
    pub fn execute(&mut self, mut task: Box<dyn Task<C> + 'a>, ctx: &mut C) -> MigrationResult<()> {
        if self.interrupted() {
            warn!(task = task.name(), "interrupt requested, not starting task");
            return Err(self.unwind(ctx, MigrationError::Interrupted));
        }

        let name = task.name().to_string();
        let description = task.description();
        self.observer.on_event(&TaskEvent::Started {
            name: name.clone(),
            description: description.clone(),
        });

        let start = Instant::now();
        let result = task.run(ctx);
        let elapsed = start.elapsed();

        self.observer.on_event(&TaskEvent::Finished {
            name: name.clone(),
            description,
            elapsed,
            success: result.is_ok(),
        });

        match result {
            Ok(()) => {
                debug!(task = %name, elapsed_ms = elapsed.as_millis() as u64, "task finished");
                self.completed.push(task);
                Ok(())
            }
            Err(err) => {
                warn!(task = %name, error = %err, "task failed, unwinding");
                Err(self.unwind(ctx, err))
            }
        }
    }

    /// Run tasks in order, stopping at the first failure
    pub fn execute_all<I>(&mut self, tasks: I, ctx: &mut C) -> MigrationResult<()>
    where
        I: IntoIterator<Item = Box<dyn Task<C> + 'a>>,
    {
        for task in tasks {
            self.execute(task, ctx)?;
        }
        Ok(())
    }

    /// Compensate every completed task, newest first, and hand `cause` back
    pub fn unwind(&mut self, ctx: &mut C, cause: MigrationError) -> MigrationError {
        while let Some(mut task) = self.completed.pop() {
            let outcome = task.compensate(ctx, &cause);
            if let Err(e) = &outcome {
                warn!(task = task.name(), error = %e, "compensation failed");
            }
            self.observer.on_event(&TaskEvent::Compensated {
                name: task.name().to_string(),
                success: outcome.is_ok(),
            });
        }
        cause
    }

    /// Number of tasks that ran successfully and are still undoable
    pub fn completed(&self) -> usize {
        self.completed.len()
    }

    /// Forget completed tasks without compensating them
    pub fn finish(mut self) -> usize {
        let count = self.completed.len();
        self.completed.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Journal {
        entries: Vec<String>,
    }

    struct Step {
        name: String,
        fail_run: bool,
        fail_compensate: bool,
    }

    impl Step {
        fn ok(name: &str) -> Box<dyn Task<Journal>> {
            Box::new(Step {
                name: name.to_string(),
                fail_run: false,
                fail_compensate: false,
            })
        }

        fn failing(name: &str) -> Box<dyn Task<Journal>> {
            Box::new(Step {
                name: name.to_string(),
                fail_run: true,
                fail_compensate: false,
            })
        }

        fn bad_undo(name: &str) -> Box<dyn Task<Journal>> {
            Box::new(Step {
                name: name.to_string(),
                fail_run: false,
                fail_compensate: true,
            })
        }
    }

    impl Task<Journal> for Step {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&mut self, ctx: &mut Journal) -> MigrationResult<()> {
            if self.fail_run {
                return Err(MigrationError::internal(format!("{} failed", self.name)));
            }
            ctx.entries.push(format!("run {}", self.name));
            Ok(())
        }

        fn compensate(&mut self, ctx: &mut Journal, _cause: &MigrationError) -> MigrationResult<()> {
            if self.fail_compensate {
                return Err(MigrationError::internal("undo failed"));
            }
            ctx.entries.push(format!("undo {}", self.name));
            Ok(())
        }
    }

    struct NoUndo;

    impl Task<Journal> for NoUndo {
        fn name(&self) -> &str {
            "no-undo"
        }

        fn run(&mut self, ctx: &mut Journal) -> MigrationResult<()> {
            ctx.entries.push("run no-undo".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_runs_in_order() {
        let mut observer = NullObserver;
        let mut runner = TaskRunner::new(&mut observer);
        let mut journal = Journal::default();

        runner
            .execute_all(vec![Step::ok("a"), Step::ok("b")], &mut journal)
            .unwrap();
        assert_eq!(journal.entries, vec!["run a", "run b"]);
        assert_eq!(runner.finish(), 2);
    }

    #[test]
    fn test_failure_compensates_lifo() {
        let mut observer = NullObserver;
        let mut runner = TaskRunner::new(&mut observer);
        let mut journal = Journal::default();

        let err = runner
            .execute_all(
                vec![
                    Step::ok("a"),
                    Box::new(NoUndo),
                    Step::ok("b"),
                    Step::failing("c"),
                    Step::ok("d"),
                ],
                &mut journal,
            )
            .unwrap_err();

        assert_eq!(err.to_string(), "Internal error: c failed");
        assert_eq!(
            journal.entries,
            vec!["run a", "run no-undo", "run b", "undo b", "undo a"]
        );
        assert_eq!(runner.completed(), 0);
    }

    #[test]
    fn test_compensation_errors_are_swallowed() {
        let mut observer = NullObserver;
        let mut runner = TaskRunner::new(&mut observer);
        let mut journal = Journal::default();

        let err = runner
            .execute_all(
                vec![Step::ok("a"), Step::bad_undo("b"), Step::failing("c")],
                &mut journal,
            )
            .unwrap_err();

        assert!(err.to_string().contains("c failed"));
        assert_eq!(journal.entries, vec!["run a", "run b", "undo a"]);
    }

    #[test]
    fn test_observer_receives_events() {
        let mut events = Vec::new();
        {
            let mut observer = |event: &TaskEvent| events.push(event.clone());
            let mut runner = TaskRunner::new(&mut observer);
            let mut journal = Journal::default();
            let _ = runner.execute_all(vec![Step::ok("a"), Step::failing("b")], &mut journal);
        }

        let kinds: Vec<String> = events
            .iter()
            .map(|e| match e {
                TaskEvent::Started { name, .. } => format!("start {}", name),
                TaskEvent::Finished { name, success, .. } => format!("end {} {}", name, success),
                TaskEvent::Compensated { name, .. } => format!("undo {}", name),
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["start a", "end a true", "start b", "end b false", "undo a"]
        );
    }

    #[test]
    fn test_interrupt_stops_before_next_task() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut observer = NullObserver;
        let mut runner = TaskRunner::new(&mut observer).with_interrupt(Arc::clone(&flag));
        let mut journal = Journal::default();

        runner.execute(Step::ok("a"), &mut journal).unwrap();
        flag.store(true, Ordering::SeqCst);
        let err = runner.execute(Step::ok("b"), &mut journal).unwrap_err();

        assert!(matches!(err, MigrationError::Interrupted));
        assert_eq!(journal.entries, vec!["run a", "undo a"]);
    }
}
