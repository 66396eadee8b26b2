pub mod by_name;
pub mod port;
pub mod process_manager;

pub use by_name::ByNameDiscoverer;
pub use port::PortDiscoverer;
pub use process_manager::ProcessManagerDiscoverer;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::utils::command::CommandRunner;
use crate::utils::errors::MonitoringError;
use crate::utils::procnet::SocketTable;

/// Discovery strategy of a session; also the `monitoring_mode` tag of every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MonitoringMode {
    /// Processes listening on the target port
    Port,
    /// Processes listed by the pm2 inventory
    Pm2,
    /// By-name discovery preset for gunicorn workers
    Gunicorn,
    /// Processes whose name or command line matches a substring
    ByName,
}

impl MonitoringMode {
    pub fn tag(&self) -> &'static str {
        match self {
            MonitoringMode::Port => "port",
            MonitoringMode::Pm2 => "pm2",
            MonitoringMode::Gunicorn => "gunicorn",
            MonitoringMode::ByName => "by-name",
        }
    }
}

impl fmt::Display for MonitoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Determines which pids currently belong to the monitored service.
#[async_trait]
pub trait ProcessDiscoverer: Send + Sync {
    async fn discover(&self) -> Result<BTreeSet<u32>, MonitoringError>;

    fn mode(&self) -> MonitoringMode;

    /// Human readable target, e.g. "processes on port 8080".
    fn describe(&self) -> String;
}

/// Runs synchronous procfs work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, MonitoringError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| MonitoringError::ProcessDiscoveryError(format!("blocking task failed: {}", e)))
}

/// Builds the discoverer selected by `config.mode`.
pub fn build_discoverer(
    config: &MonitorConfig,
    runner: Arc<dyn CommandRunner>,
    sockets: Arc<dyn SocketTable>,
) -> Result<Box<dyn ProcessDiscoverer>, MonitoringError> {
    config.validate()?;

    let discoverer: Box<dyn ProcessDiscoverer> = match config.mode {
        MonitoringMode::Port => {
            let port = config.port.ok_or_else(|| {
                MonitoringError::Other("A port is required in port mode".to_string())
            })?;
            Box::new(
                PortDiscoverer::new(port, sockets, runner)
                    .with_fallback_program(config.port_lookup_program.clone()),
            )
        }
        MonitoringMode::Pm2 => Box::new(ProcessManagerDiscoverer::new(
            config.pm_program.clone(),
            config.name_filter.clone(),
            runner,
        )),
        MonitoringMode::Gunicorn | MonitoringMode::ByName => {
            let pattern = config.target_process_name().ok_or_else(|| {
                MonitoringError::Other("A process name is required in by-name mode".to_string())
            })?;
            Box::new(ByNameDiscoverer::new(
                pattern,
                config.port,
                config.mode,
                sockets,
            ))
        }
    };

    Ok(discoverer)
}
