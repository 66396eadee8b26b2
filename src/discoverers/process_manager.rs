use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::discoverers::{MonitoringMode, ProcessDiscoverer};
use crate::utils::command::CommandRunner;
use crate::utils::errors::MonitoringError;

/// One entry of `pm2 jlist`.
#[derive(Debug, Deserialize)]
struct ManagedProcess {
    pid: Option<i64>,
    name: Option<String>,
    pm2_env: Option<ManagedEnv>,
}

#[derive(Debug, Deserialize)]
struct ManagedEnv {
    name: Option<String>,
}

impl ManagedProcess {
    fn managed_name(&self) -> Option<&str> {
        self.pm2_env
            .as_ref()
            .and_then(|env| env.name.as_deref())
            .or(self.name.as_deref())
    }

    fn live_pid(&self) -> Option<u32> {
        self.pid
            .filter(|&pid| pid > 0)
            .and_then(|pid| u32::try_from(pid).ok())
    }
}

/// Asks the process manager which pids it runs.
pub struct ProcessManagerDiscoverer {
    program: String,
    name_filter: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl ProcessManagerDiscoverer {
    pub fn new(
        program: impl Into<String>,
        name_filter: Option<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            program: program.into(),
            name_filter,
            runner,
        }
    }
}

#[async_trait]
impl ProcessDiscoverer for ProcessManagerDiscoverer {
    async fn discover(&self) -> Result<BTreeSet<u32>, MonitoringError> {
        let output = self.runner.run(&self.program, &["jlist"]).await?;
        if !output.success {
            return Err(MonitoringError::CommandError {
                program: self.program.clone(),
                reason: format!(
                    "jlist exited with {}: {}",
                    output
                        .code
                        .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    output.stderr.trim()
                ),
            });
        }
        parse_inventory(&output.stdout, self.name_filter.as_deref())
    }

    fn mode(&self) -> MonitoringMode {
        MonitoringMode::Pm2
    }

    fn describe(&self) -> String {
        match &self.name_filter {
            Some(name) => format!("{} processes named '{}'", self.program, name),
            None => format!("processes managed by {}", self.program),
        }
    }
}

/// Selects live pids from a JSON inventory, optionally by managed name.
pub fn parse_inventory(
    json: &str,
    name_filter: Option<&str>,
) -> Result<BTreeSet<u32>, MonitoringError> {
    let entries: Vec<ManagedProcess> = serde_json::from_str(json)
        .map_err(|e| MonitoringError::ParseError(format!("process manager inventory: {}", e)))?;

    Ok(entries
        .iter()
        .filter(|entry| match name_filter {
            Some(filter) => entry.managed_name() == Some(filter),
            None => true,
        })
        .filter_map(ManagedProcess::live_pid)
        .collect())
}
