//! migrata - schema migration and deployment orchestrator
//!
//! Versioned scripts are applied to a target database under a named lock,
//! and every deployment and change is recorded in a history ledger that
//! lives in the same database.
//!
//! The engine is synchronous. Each deployment runs as a sequence of
//! reversible tasks, so a failure at any step releases the lock, rolls back
//! open work and closes the deployment record with the error.

pub mod cli;
pub mod config;
pub mod deploy;
pub mod history;
pub mod hooks;
pub mod lock;
pub mod migrations;
pub mod observability;
pub mod panic_handler;
pub mod project;
pub mod session;
pub mod task;
