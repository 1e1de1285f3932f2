//! CLI argument definitions using clap
//!
//! Commands:
//! - migrata init <dir> [--env NAME --dsn DSN]
//! - migrata migrate --env E [--tag T] [--count N | --paths P..] [--dry-run]
//! - migrata rollback --env E (--tag T | --count N | --date D | --paths P..) [--dry-run]
//! - migrata status --env E
//! - migrata env <add|remove|list>
//! - migrata migration <add|remove>

use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

/// migrata - schema migration and deployment orchestrator
#[derive(Parser, Debug)]
#[command(name = "migrata")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Project file, or the directory holding migrata.yaml
    #[arg(long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Debug logging and error details
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a project: config file, migrations directory and, with
    /// --env/--dsn, the history ledger of that environment
    Init {
        /// Project directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,

        /// Environment to register
        #[arg(long, requires = "dsn")]
        env: Option<String>,

        /// DSN of the environment
        #[arg(long, requires = "env")]
        dsn: Option<String>,

        /// History schema of the environment
        #[arg(long, default_value = "migrata")]
        history_schema: String,
    },

    /// Apply pending migrations
    Migrate {
        /// Target environment
        #[arg(long)]
        env: String,

        /// Deployment tag (generated when omitted)
        #[arg(long)]
        tag: Option<String>,

        /// Apply at most N changes
        #[arg(long, conflicts_with = "paths")]
        count: Option<usize>,

        /// Only consider these locations
        #[arg(long, num_args = 1..)]
        paths: Vec<String>,

        /// Show the plan without locking or writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Reverse deployed changes
    #[command(group(
        ArgGroup::new("strategy")
            .required(true)
            .args(["tag", "count", "date", "paths"])
    ))]
    Rollback {
        /// Target environment
        #[arg(long)]
        env: String,

        /// Reverse everything deployed after this deployment ended
        #[arg(long)]
        tag: Option<String>,

        /// Reverse the N most recent changes
        #[arg(long)]
        count: Option<usize>,

        /// Reverse everything deployed after this instant (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,

        /// Reverse the latest change of these locations
        #[arg(long, num_args = 1..)]
        paths: Vec<String>,

        /// Tag of the rollback deployment itself (generated when omitted)
        #[arg(long)]
        deployment_tag: Option<String>,

        /// Show the selection without locking or writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Show applied changes and pending work
    Status {
        /// Target environment
        #[arg(long)]
        env: String,
    },

    /// Manage environments
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },

    /// Manage migration files
    Migration {
        #[command(subcommand)]
        action: MigrationAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum EnvAction {
    /// Register an environment
    Add {
        name: String,

        #[arg(long)]
        dsn: String,

        #[arg(long, default_value = "migrata")]
        history_schema: String,
    },

    /// Remove an environment
    Remove { name: String },

    /// List environments
    List,
}

#[derive(Subcommand, Debug)]
pub enum MigrationAction {
    /// Create a migration file from the template
    Add {
        name: String,

        /// once, onchange-before, onchange-after, always-before, always-after
        #[arg(long, default_value = "once")]
        policy: String,
    },

    /// Delete a migration file by location
    Remove { location: String },
}
