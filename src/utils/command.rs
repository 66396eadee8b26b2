use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::utils::errors::MonitoringError;

/// Captured result of an external tool invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external tools (port lookup utility, process manager inventory).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, MonitoringError>;
}

/// [`CommandRunner`] spawning real processes through tokio.
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, MonitoringError> {
        let child = Command::new(program).args(args).kill_on_drop(true).output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| MonitoringError::CommandError {
                program: program.to_string(),
                reason: format!("timed out after {:?}", self.timeout),
            })?
            .map_err(|e| MonitoringError::CommandError {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_command_error() {
        let runner = TokioCommandRunner::default();
        let result = runner.run("procmon-no-such-tool", &["--version"]).await;
        assert!(matches!(result, Err(MonitoringError::CommandError { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_stdout_and_status() {
        let runner = TokioCommandRunner::default();
        let output = runner.run("sh", &["-c", "echo 42; exit 3"]).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "42");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_command_error() {
        let runner = TokioCommandRunner::new(Duration::from_millis(50));
        let result = runner.run("sh", &["-c", "sleep 5"]).await;
        match result {
            Err(MonitoringError::CommandError { reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }
}
