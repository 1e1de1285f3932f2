//! # Project
//!
//! A project directory holds `migrata.yaml` and the migrations directory.
//! `init` provisions one as a sequence of reversible tasks: a failure at any
//! step removes what the earlier steps created.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{resolve_config_path, EnvironmentConfig, ProjectConfig, CONFIG_FILE};
use crate::history::Ledger;
use crate::hooks::CommandHookRunner;
use crate::migrations::{FsMigrationStore, MigrationError, MigrationResult};
use crate::session::{self, Backend};
use crate::task::{Task, TaskObserver, TaskRunner};

/// A loaded project
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    config_path: PathBuf,
    config: ProjectConfig,
}

impl Project {
    /// Open the project at `path`, a project file or its directory
    pub fn open(path: &Path) -> MigrationResult<Self> {
        let config_path = resolve_config_path(path);
        if !config_path.is_file() {
            return Err(MigrationError::InvalidConfig(format!(
                "no project file at {}; run 'migrata init' first",
                config_path.display()
            )));
        }
        let config = ProjectConfig::load(&config_path)?;
        let root = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            root,
            config_path,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProjectConfig {
        &mut self.config
    }

    /// Persist the current configuration
    pub fn save(&self) -> MigrationResult<()> {
        self.config.save(&self.config_path)
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.config.migrations_dir(&self.root)
    }

    pub fn store(&self) -> FsMigrationStore {
        FsMigrationStore::new(self.migrations_dir(), self.config.store_options())
    }

    /// Open a session to an environment's database
    pub fn connect(&self, env_name: &str) -> MigrationResult<Box<dyn Backend>> {
        let env = self.config.environment(env_name)?;
        session::connect(&env.dsn, &self.root)
    }

    pub fn hook_runner(&self) -> CommandHookRunner {
        CommandHookRunner::new(self.config.hooks.clone())
    }
}

/// Options for `init`
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Project name; defaults to the directory name
    pub name: Option<String>,
    /// Environment registered and bootstrapped during init
    pub environment: Option<(String, EnvironmentConfig)>,
}

struct InitContext {
    root: PathBuf,
    config_path: PathBuf,
    config: ProjectConfig,
    environment: Option<String>,
}

struct CreateDirectory {
    path: PathBuf,
    created: bool,
}

impl CreateDirectory {
    fn new(path: PathBuf) -> Box<Self> {
        Box::new(Self {
            path,
            created: false,
        })
    }
}

impl Task<InitContext> for CreateDirectory {
    fn name(&self) -> &str {
        "create-directory"
    }

    fn description(&self) -> String {
        format!("create {}", self.path.display())
    }

    fn run(&mut self, _ctx: &mut InitContext) -> MigrationResult<()> {
        if self.path.exists() {
            if !self.path.is_dir() {
                return Err(MigrationError::validation(
                    "project directory",
                    format!("{} exists and is not a directory", self.path.display()),
                ));
            }
            return Ok(());
        }
        fs::create_dir_all(&self.path).map_err(|e| MigrationError::io(&self.path, e))?;
        self.created = true;
        Ok(())
    }

    fn compensate(&mut self, _ctx: &mut InitContext, _cause: &MigrationError) -> MigrationResult<()> {
        if self.created {
            fs::remove_dir_all(&self.path).map_err(|e| MigrationError::io(&self.path, e))?;
        }
        Ok(())
    }
}

struct WriteConfig;

impl Task<InitContext> for WriteConfig {
    fn name(&self) -> &str {
        "write-config"
    }

    fn run(&mut self, ctx: &mut InitContext) -> MigrationResult<()> {
        if ctx.config_path.exists() {
            return Err(MigrationError::validation(
                "project",
                format!("already initialized at {}", ctx.config_path.display()),
            ));
        }
        ctx.config.save(&ctx.config_path)
    }

    fn compensate(&mut self, ctx: &mut InitContext, _cause: &MigrationError) -> MigrationResult<()> {
        fs::remove_file(&ctx.config_path).map_err(|e| MigrationError::io(&ctx.config_path, e))
    }
}

struct CreateHistorySchema;

impl Task<InitContext> for CreateHistorySchema {
    fn name(&self) -> &str {
        "create-history-schema"
    }

    fn run(&mut self, ctx: &mut InitContext) -> MigrationResult<()> {
        let Some(env_name) = ctx.environment.as_deref() else {
            return Ok(());
        };
        let env = ctx.config.environment(env_name)?;
        let mut session = session::connect(&env.dsn, &ctx.root)?;
        let mut ledger = Ledger::new(&env.history_schema)?;
        ledger.prepare(&mut *session, true)?;
        info!(environment = env_name, schema = %env.history_schema, "history ledger ready");
        Ok(())
    }
}

/// Provision a project in `dir`
pub fn init(
    dir: &Path,
    options: &InitOptions,
    observer: &mut dyn TaskObserver,
) -> MigrationResult<Project> {
    let name = options
        .name
        .clone()
        .or_else(|| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "migrata".to_string());

    let mut config = ProjectConfig::new(name);
    let mut environment = None;
    if let Some((env_name, env)) = &options.environment {
        config.add_environment(env_name, env.clone())?;
        environment = Some(env_name.trim().to_string());
    }
    config.validate()?;

    let mut ctx = InitContext {
        root: dir.to_path_buf(),
        config_path: dir.join(CONFIG_FILE),
        config,
        environment,
    };
    let migrations_dir = ctx.config.migrations_dir(&ctx.root);

    let mut runner = TaskRunner::new(observer);
    let steps: Vec<Box<dyn Task<InitContext> + '_>> = vec![
        CreateDirectory::new(ctx.root.clone()),
        CreateDirectory::new(migrations_dir),
        Box::new(WriteConfig),
        Box::new(CreateHistorySchema),
    ];
    if let Err(e) = runner.execute_all(steps, &mut ctx) {
        warn!(dir = %dir.display(), error = %e, "init failed, provisioning undone");
        return Err(e);
    }
    runner.finish();

    info!(dir = %dir.display(), "project initialized");
    Ok(Project {
        root: ctx.root,
        config_path: ctx.config_path,
        config: ctx.config,
    })
}
