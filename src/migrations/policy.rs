//! # Migration Policy Evaluation
//!
//! Pure decision: given the latest recorded change for a location and the
//! migration currently in the store, decide what the deployment does.

use super::errors::DriftReason;
use super::Migration;
use crate::history::{Change, ChangeStatus};

/// What a deployment does with one migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing to do
    Skip,
    /// First-time apply
    Migrate,
    /// Apply again
    Remigrate,
    /// Fatal checksum mismatch
    Drift(DriftReason),
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Skip => "skip",
            Disposition::Migrate => "migrate",
            Disposition::Remigrate => "remigrate",
            Disposition::Drift(_) => "drift",
        }
    }

    /// Status recorded when the disposition is executed
    pub fn status(&self) -> Option<ChangeStatus> {
        match self {
            Disposition::Migrate => Some(ChangeStatus::Migrated),
            Disposition::Remigrate => Some(ChangeStatus::Remigrated),
            Disposition::Skip | Disposition::Drift(_) => None,
        }
    }
}

/// Evaluate a migration against its latest recorded change
pub fn evaluate(latest: Option<&Change>, migration: &Migration) -> Disposition {
    let latest = match latest {
        Some(change) => change,
        None => return Disposition::Migrate,
    };

    let script_changed = migration.checksum != latest.checksum;

    if latest.migrate_policy == super::MigratePolicy::Once {
        return if script_changed {
            Disposition::Drift(DriftReason::OnceChanged)
        } else {
            Disposition::Skip
        };
    }

    // rolled back scripts are never reapplied automatically
    if latest.status == ChangeStatus::Rollbacked {
        return if script_changed {
            Disposition::Drift(DriftReason::RollbackedChanged)
        } else {
            Disposition::Skip
        };
    }

    if !script_changed && latest.migrate_policy.is_onchange() {
        return Disposition::Skip;
    }

    Disposition::Remigrate
}
