//! External command hooks.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use super::{HookEnv, HookEvent, HookRunner};
use crate::migrations::{MigrationError, MigrationResult};

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_abort_on_error() -> bool {
    true
}

/// One configured hook command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    pub event: HookEvent,

    /// Program followed by its arguments
    pub command: Vec<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_abort_on_error")]
    pub abort_on_error: bool,
}

impl HookConfig {
    pub fn new(event: HookEvent, command: Vec<String>) -> Self {
        Self {
            event,
            command,
            timeout_ms: default_timeout_ms(),
            abort_on_error: default_abort_on_error(),
        }
    }

    /// Display name, the program path
    pub fn name(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("")
    }
}

/// Runs hook commands as child processes with a timeout
pub struct CommandHookRunner {
    hooks: Vec<HookConfig>,
    runtime: Option<Runtime>,
}

impl CommandHookRunner {
    pub fn new(hooks: Vec<HookConfig>) -> Self {
        Self {
            hooks,
            runtime: None,
        }
    }

    fn runtime(&mut self) -> MigrationResult<&Runtime> {
        if self.runtime.is_none() {
            let runtime = Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .map_err(|e| MigrationError::internal(format!("failed to start hook runtime: {}", e)))?;
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| MigrationError::internal("hook runtime unavailable"))
    }

    /// Run one hook, returning a failure message when it did not succeed
    fn invoke(runtime: &Runtime, hook: &HookConfig, event: HookEvent, env: &HookEnv) -> Result<(), String> {
        let (program, args) = hook
            .command
            .split_first()
            .ok_or_else(|| "hook has an empty command".to_string())?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env("MIGRATA_EVENT", event.as_str())
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = Duration::from_millis(hook.timeout_ms);
        let output = runtime
            .block_on(async { tokio::time::timeout(timeout, cmd.output()).await })
            .map_err(|_| format!("timed out after {}ms", hook.timeout_ms))?
            .map_err(|e| format!("failed to start: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("exited with {}: {}", output.status, stderr.trim()))
        }
    }
}

impl HookRunner for CommandHookRunner {
    fn run(&mut self, event: HookEvent, env: &HookEnv) -> MigrationResult<()> {
        let selected: Vec<HookConfig> = self
            .hooks
            .iter()
            .filter(|hook| hook.event == event)
            .cloned()
            .collect();
        if selected.is_empty() {
            return Ok(());
        }

        let runtime = self.runtime()?;
        for hook in &selected {
            info!(event = %event, hook = hook.name(), "running hook");
            if let Err(message) = Self::invoke(runtime, hook, event, env) {
                if hook.abort_on_error {
                    return Err(MigrationError::HookFailed {
                        event: event.to_string(),
                        hook: hook.name().to_string(),
                        message,
                    });
                }
                warn!(event = %event, hook = hook.name(), error = %message, "hook failed, continuing");
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::history::Command;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn env() -> HookEnv {
        HookEnv::for_deployment("v1", Command::Migrate, "alice", "memory://x", false, true)
    }

    #[test]
    fn test_hook_receives_environment() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.txt");
        let script = format!(
            "echo \"$MIGRATA_EVENT $MIGRATA_DEPLOYMENT_TAG\" > {}",
            out.display()
        );
        let mut runner = CommandHookRunner::new(vec![HookConfig::new(HookEvent::BeforeDeploy, sh(&script))]);

        runner.run(HookEvent::BeforeDeploy, &env()).unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "before-deploy v1");
    }

    #[test]
    fn test_only_matching_event_runs() {
        let mut runner = CommandHookRunner::new(vec![HookConfig::new(HookEvent::AfterDeploy, sh("exit 1"))]);
        assert!(runner.run(HookEvent::BeforeDeploy, &env()).is_ok());
        assert!(runner.run(HookEvent::AfterDeploy, &env()).is_err());
    }

    #[test]
    fn test_failure_policy() {
        let mut tolerant = HookConfig::new(HookEvent::AfterConnect, sh("echo nope >&2; exit 3"));
        tolerant.abort_on_error = false;
        let mut runner = CommandHookRunner::new(vec![tolerant.clone()]);
        assert!(runner.run(HookEvent::AfterConnect, &env()).is_ok());

        tolerant.abort_on_error = true;
        let mut runner = CommandHookRunner::new(vec![tolerant]);
        match runner.run(HookEvent::AfterConnect, &env()) {
            Err(MigrationError::HookFailed { hook, message, .. }) => {
                assert_eq!(hook, "sh");
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_timeout_kills_hook() {
        let mut hook = HookConfig::new(HookEvent::BeforeConnect, sh("sleep 5"));
        hook.timeout_ms = 100;
        let mut runner = CommandHookRunner::new(vec![hook]);

        let start = std::time::Instant::now();
        let err = runner.run(HookEvent::BeforeConnect, &env()).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
