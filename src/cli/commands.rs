//! CLI command implementations
//!
//! Each command loads the project, does its work and returns a JSON value;
//! `run` writes it to stdout.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::EnvironmentConfig;
use crate::deploy::{Coordinator, MigrateRequest, RollbackRequest, RollbackStrategy};
use crate::migrations::generator::MigrationGenerator;
use crate::migrations::{MigratePolicy, MigrationResult};
use crate::observability::TaskLog;
use crate::project::{self, InitOptions, Project};

use super::args::{Cli, Command, EnvAction, MigrationAction};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Run the parsed command line, writing the result to stdout
pub fn run(cli: Cli, interrupt: Arc<AtomicBool>) -> CliResult<()> {
    let output = run_command(&cli.project, cli.command, interrupt)?;
    write_response(output)
}

/// Execute one command and return its output
pub fn run_command(project_path: &Path, cmd: Command, interrupt: Arc<AtomicBool>) -> CliResult<Value> {
    debug!(command = ?cmd, project = %project_path.display(), "running command");
    match cmd {
        Command::Init {
            dir,
            name,
            env,
            dsn,
            history_schema,
        } => {
            let environment = match (env, dsn) {
                (Some(env), Some(dsn)) => {
                    Some((env, EnvironmentConfig::new(dsn).with_history_schema(history_schema)))
                }
                _ => None,
            };
            init(&dir, InitOptions { name, environment })
        }
        Command::Migrate {
            env,
            tag,
            count,
            paths,
            dry_run,
        } => {
            if count == Some(0) {
                return Err(CliError::invalid_arguments("--count must be at least 1"));
            }
            let request = MigrateRequest {
                tag,
                limit: count,
                paths,
                dry_run,
            };
            migrate(project_path, &env, &request, interrupt)
        }
        Command::Rollback {
            env,
            tag,
            count,
            date,
            paths,
            deployment_tag,
            dry_run,
        } => {
            let strategy = rollback_strategy(tag, count, date, paths)?;
            let request = RollbackRequest {
                tag: deployment_tag,
                strategy,
                dry_run,
            };
            rollback(project_path, &env, &request, interrupt)
        }
        Command::Status { env } => status(project_path, &env),
        Command::Env { action } => environments(project_path, action),
        Command::Migration { action } => migrations(project_path, action),
    }
}

fn init(dir: &Path, options: InitOptions) -> CliResult<Value> {
    let log = TaskLog::new();
    let mut observer = log.clone();
    let project = project::init(dir, &options, &mut observer)?;
    Ok(json!({
        "initialized": true,
        "name": project.config().name,
        "config": project.config_path().to_string_lossy(),
        "migrations_dir": project.migrations_dir().to_string_lossy(),
        "environments": project.config().environments.keys().collect::<Vec<_>>(),
        "tasks": log.entries(),
    }))
}

/// Run `f` against a coordinator wired to the project's environment
fn with_coordinator<T, F>(
    project_path: &Path,
    env: &str,
    interrupt: Arc<AtomicBool>,
    log: &TaskLog,
    f: F,
) -> MigrationResult<T>
where
    F: FnOnce(&mut Coordinator<'_>) -> MigrationResult<T>,
{
    let project = Project::open(project_path)?;
    let settings = project.config().deploy_settings(env)?;
    let store = project.store();
    let mut session = project.connect(env)?;

    let mut coordinator = Coordinator::new(&mut *session, &store, settings)
        .with_hooks(Box::new(project.hook_runner()))
        .with_observer(Box::new(log.clone()))
        .with_interrupt(interrupt);
    f(&mut coordinator)
}

fn migrate(
    project_path: &Path,
    env: &str,
    request: &MigrateRequest,
    interrupt: Arc<AtomicBool>,
) -> CliResult<Value> {
    let log = TaskLog::new();
    let report = with_coordinator(project_path, env, interrupt, &log, |c| c.migrate(request))?;
    Ok(json!({
        "environment": env,
        "report": report,
        "tasks": log.entries(),
    }))
}

fn rollback(
    project_path: &Path,
    env: &str,
    request: &RollbackRequest,
    interrupt: Arc<AtomicBool>,
) -> CliResult<Value> {
    let log = TaskLog::new();
    let report = with_coordinator(project_path, env, interrupt, &log, |c| c.rollback(request))?;
    Ok(json!({
        "environment": env,
        "strategy": request.strategy.to_string(),
        "report": report,
        "tasks": log.entries(),
    }))
}

fn status(project_path: &Path, env: &str) -> CliResult<Value> {
    let log = TaskLog::new();
    let interrupt = Arc::new(AtomicBool::new(false));
    let report = with_coordinator(project_path, env, interrupt, &log, |c| c.status())?;
    Ok(json!({
        "environment": env,
        "status": report,
    }))
}

fn environments(project_path: &Path, action: EnvAction) -> CliResult<Value> {
    let mut project = Project::open(project_path)?;
    match action {
        EnvAction::Add {
            name,
            dsn,
            history_schema,
        } => {
            let env = EnvironmentConfig::new(dsn).with_history_schema(history_schema);
            project.config_mut().add_environment(&name, env.clone())?;
            project.save()?;
            Ok(json!({ "added": name, "environment": env }))
        }
        EnvAction::Remove { name } => {
            let removed = project.config_mut().remove_environment(&name)?;
            project.save()?;
            Ok(json!({ "removed": name, "environment": removed }))
        }
        EnvAction::List => Ok(json!({ "environments": project.config().environments })),
    }
}

fn migrations(project_path: &Path, action: MigrationAction) -> CliResult<Value> {
    let project = Project::open(project_path)?;
    let migrations_dir = project.migrations_dir();
    let generator = MigrationGenerator::new(migrations_dir.clone());

    match action {
        MigrationAction::Add { name, policy } => {
            let policy: MigratePolicy = policy.parse()?;
            let path = generator.create(&name, policy, &whoami::username())?;
            let location = path
                .strip_prefix(&migrations_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            Ok(json!({
                "created": true,
                "location": location,
                "policy": policy,
                "file": path.to_string_lossy(),
            }))
        }
        MigrationAction::Remove { location } => {
            let path = generator.remove(&location)?;
            Ok(json!({
                "removed": true,
                "location": location,
                "file": path.to_string_lossy(),
            }))
        }
    }
}

fn rollback_strategy(
    tag: Option<String>,
    count: Option<usize>,
    date: Option<String>,
    paths: Vec<String>,
) -> CliResult<RollbackStrategy> {
    let strategy = match (tag, count, date) {
        (Some(tag), None, None) if paths.is_empty() => RollbackStrategy::Tag(tag),
        (None, Some(count), None) if paths.is_empty() => RollbackStrategy::Count(count),
        (None, None, Some(date)) if paths.is_empty() => RollbackStrategy::Date(parse_date(&date)?),
        (None, None, None) if !paths.is_empty() => RollbackStrategy::Paths(paths),
        _ => {
            return Err(CliError::invalid_arguments(
                "exactly one of --tag, --count, --date or --paths is required",
            ))
        }
    };
    strategy.validate()?;
    Ok(strategy)
}

/// RFC 3339 timestamp, or a date taken as midnight UTC
fn parse_date(raw: &str) -> CliResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            CliError::invalid_arguments(format!(
                "--date '{}' is neither RFC 3339 nor YYYY-MM-DD",
                raw
            ))
        })
}
