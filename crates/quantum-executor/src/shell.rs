//! Shell command executor.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use quantum_config::{ExecutorSettings, VariableContext};
use quantum_core::{Error, Executor, PrNumber, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How many trailing output lines are kept in the log for a failed run.
const OUTPUT_TAIL: usize = 20;

/// Runs a command template through `/bin/sh -c` for every PR.
///
/// Exit status 0 means the checks passed. A command that cannot be spawned or
/// outlives the timeout is an executor error rather than a failed check.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    command: String,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
    shell: PathBuf,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            env: BTreeMap::new(),
            shell: PathBuf::from("/bin/sh"),
        }
    }

    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self {
            timeout: settings.timeout,
            env: settings.env.clone(),
            ..Self::new(settings.command.clone())
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn variables(&self, pr: PrNumber) -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.populate_env();
        ctx.pr_number = Some(pr);
        ctx
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, pr: PrNumber) -> Result<bool> {
        let vars = self.variables(pr);
        let script = vars.interpolate(&self.command);
        let env = vars.interpolate_map(&self.env);

        debug!(pr = %pr, script = %script, "Spawning command");
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&script)
            .envs(&env)
            .env("QUANTUM_PR_NUMBER", pr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to spawn {:?}: {}", script, e)))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    warn!(pr = %pr, timeout = ?limit, "Command timed out");
                    Error::ExecutionFailed(format!("timed out after {:?}", limit))
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| Error::ExecutionFailed(format!("failed to wait for command: {}", e)))?;

        let passed = output.status.success();
        if passed {
            info!(pr = %pr, "Checks passed");
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(OUTPUT_TAIL).collect();
            for line in tail.into_iter().rev() {
                debug!(pr = %pr, "{}", line);
            }
            info!(pr = %pr, code = ?output.status.code(), "Checks failed");
        }
        Ok(passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(n: u64) -> PrNumber {
        PrNumber::new(n)
    }

    #[tokio::test]
    async fn test_exit_status_decides_the_result() {
        assert!(ShellExecutor::new("true").execute(pr(1)).await.unwrap());
        assert!(!ShellExecutor::new("exit 3").execute(pr(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_pr_number_is_exported_and_interpolated() {
        let exported = ShellExecutor::new(r#"test "$QUANTUM_PR_NUMBER" = 42"#);
        assert!(exported.execute(pr(42)).await.unwrap());

        let templated = ShellExecutor::new("test ${pr.number} = 7");
        assert!(templated.execute(pr(7)).await.unwrap());
        assert!(!templated.execute(pr(8)).await.unwrap());
    }

    #[tokio::test]
    async fn test_configured_env_is_passed() {
        let settings = ExecutorSettings {
            kind: "shell".to_string(),
            command: r#"test "$CI" = true && test "$TARGET" = pr-5"#.to_string(),
            timeout: None,
            env: BTreeMap::from([
                ("CI".to_string(), "true".to_string()),
                ("TARGET".to_string(), "pr-${pr.number}".to_string()),
            ]),
        };
        let executor = ShellExecutor::from_settings(&settings);
        assert!(executor.execute(pr(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_is_an_executor_error() {
        let executor = ShellExecutor::new("sleep 5").with_timeout(Duration::from_millis(100));
        let err = executor.execute(pr(1)).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_executor_error() {
        let executor = ShellExecutor::new("true").with_shell("/nonexistent/shell");
        let err = executor.execute(pr(1)).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(msg) if msg.contains("failed to spawn")));
    }

    #[tokio::test]
    async fn test_noisy_failure_still_reports_fail() {
        let executor = ShellExecutor::new("for i in 1 2 3; do echo line $i >&2; done; exit 1")
            .with_env("UNUSED", "x");
        assert!(!executor.execute(pr(2)).await.unwrap());
    }
}
