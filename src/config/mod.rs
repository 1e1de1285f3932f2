//! # Project Configuration
//!
//! A project is described by one YAML file, `migrata.yaml`:
//!
//! ```yaml
//! name: shop
//! migrations:
//!   dir: migrations
//!   natural_sort: true
//!   case_sensitive: false
//! transaction_mode: single
//! lock_timeout_ms: 30000
//! lock_poll_ms: 50
//! environments:
//!   dev:
//!     dsn: sqlite://dev.db
//!     history_schema: migrata
//! hooks:
//!   - event: after-deploy
//!     command: ["./notify.sh"]
//!     timeout_ms: 5000
//!     abort_on_error: false
//! ```
//!
//! The file is validated on every load and before every save. Saves go
//! through a temporary file and a rename so a crash never leaves a torn
//! file behind.

pub mod validator;

pub use validator::{ConfigValidationError, ConfigValidator};

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deploy::{DeploySettings, TransactionMode};
use crate::hooks::command::HookConfig;
use crate::lock::clamp_poll_interval;
use crate::migrations::{MigrationError, MigrationResult, StoreOptions};

/// Project file name
pub const CONFIG_FILE: &str = "migrata.yaml";

/// Bounds accepted for `lock_timeout_ms`
pub const LOCK_TIMEOUT_RANGE_MS: (u64, u64) = (0, 24 * 60 * 60 * 1000);

/// Bounds accepted for `lock_poll_ms`
pub const LOCK_POLL_RANGE_MS: (u64, u64) = (10, 500);

/// Bounds accepted for a hook's `timeout_ms`
pub const HOOK_TIMEOUT_RANGE_MS: (u64, u64) = (1, 60 * 60 * 1000);

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_history_schema() -> String {
    "migrata".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_lock_poll_ms() -> u64 {
    50
}

/// Where migrations live and how they are ordered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Relative to the project file
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,

    #[serde(flatten)]
    pub ordering: StoreOptions,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
            ordering: StoreOptions::default(),
        }
    }
}

/// One deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub dsn: String,

    #[serde(default = "default_history_schema")]
    pub history_schema: String,
}

impl EnvironmentConfig {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            history_schema: default_history_schema(),
        }
    }

    pub fn with_history_schema(mut self, schema: impl Into<String>) -> Self {
        self.history_schema = schema.into();
        self
    }
}

/// Contents of `migrata.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,

    #[serde(default)]
    pub migrations: MigrationsConfig,

    #[serde(default)]
    pub transaction_mode: TransactionMode,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,

    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,

    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

impl ProjectConfig {
    /// Configuration with defaults and no environments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            migrations: MigrationsConfig::default(),
            transaction_mode: TransactionMode::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_ms: default_lock_poll_ms(),
            environments: BTreeMap::new(),
            hooks: Vec::new(),
        }
    }

    /// Load and validate a project file
    pub fn load(path: &Path) -> MigrationResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| MigrationError::io(path, e))?;
        let config: ProjectConfig =
            serde_yaml::from_str(&content).map_err(|e| MigrationError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        debug!(path = %path.display(), environments = config.environments.len(), "loaded project");
        Ok(config)
    }

    /// Validate and write atomically
    pub fn save(&self, path: &Path) -> MigrationResult<()> {
        self.validate()?;
        let content = serde_yaml::to_string(self)?;

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            MigrationError::io(path, e)
        })
    }

    /// Check every field, reporting all problems at once
    pub fn validate(&self) -> MigrationResult<()> {
        let mut v = ConfigValidator::new();
        v.validate_non_empty("name", &self.name)
            .validate_non_empty("migrations.dir", &self.migrations.dir.to_string_lossy())
            .validate_duration_ms(
                "lock_timeout_ms",
                self.lock_timeout_ms,
                LOCK_TIMEOUT_RANGE_MS.0,
                LOCK_TIMEOUT_RANGE_MS.1,
            )
            .validate_duration_ms(
                "lock_poll_ms",
                self.lock_poll_ms,
                LOCK_POLL_RANGE_MS.0,
                LOCK_POLL_RANGE_MS.1,
            );

        for (name, env) in &self.environments {
            v.validate_non_empty("environments", name)
                .validate_dsn(&format!("environments.{}.dsn", name), &env.dsn)
                .validate_identifier(
                    &format!("environments.{}.history_schema", name),
                    &env.history_schema,
                );
        }

        for (i, hook) in self.hooks.iter().enumerate() {
            v.validate_command(&format!("hooks[{}].command", i), &hook.command)
                .validate_duration_ms(
                    &format!("hooks[{}].timeout_ms", i),
                    hook.timeout_ms,
                    HOOK_TIMEOUT_RANGE_MS.0,
                    HOOK_TIMEOUT_RANGE_MS.1,
                );
        }

        v.finish()
    }

    pub fn environment(&self, name: &str) -> MigrationResult<&EnvironmentConfig> {
        self.environments.get(name).ok_or_else(|| {
            MigrationError::validation("environment", format!("'{}' is not defined", name))
        })
    }

    /// Register a new environment; existing names are rejected
    pub fn add_environment(&mut self, name: &str, env: EnvironmentConfig) -> MigrationResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MigrationError::validation("environment", "name cannot be empty"));
        }
        if self.environments.contains_key(name) {
            return Err(MigrationError::validation(
                "environment",
                format!("'{}' already exists", name),
            ));
        }

        let mut v = ConfigValidator::new();
        v.validate_dsn("dsn", &env.dsn)
            .validate_identifier("history_schema", &env.history_schema);
        if v.has_errors() {
            return v.finish();
        }

        self.environments.insert(name.to_string(), env);
        Ok(())
    }

    pub fn remove_environment(&mut self, name: &str) -> MigrationResult<EnvironmentConfig> {
        self.environments.remove(name).ok_or_else(|| {
            MigrationError::validation("environment", format!("'{}' is not defined", name))
        })
    }

    /// Migrations directory resolved against the project directory
    pub fn migrations_dir(&self, project_dir: &Path) -> PathBuf {
        if self.migrations.dir.is_absolute() {
            self.migrations.dir.clone()
        } else {
            project_dir.join(&self.migrations.dir)
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        self.migrations.ordering
    }

    /// Coordinator settings for one environment
    pub fn deploy_settings(&self, env_name: &str) -> MigrationResult<DeploySettings> {
        let env = self.environment(env_name)?;
        Ok(DeploySettings {
            history_schema: env.history_schema.clone(),
            transaction_mode: self.transaction_mode,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            lock_poll: clamp_poll_interval(Duration::from_millis(self.lock_poll_ms)),
            application: self.name.clone(),
            dsn: env.dsn.clone(),
            ..DeploySettings::default()
        })
    }
}

/// Project file for a `--project` argument naming a file or a directory
pub fn resolve_config_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CONFIG_FILE)
    } else {
        path.to_path_buf()
    }
}
