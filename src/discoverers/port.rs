use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::config::DEFAULT_PORT_LOOKUP_PROGRAM;
use crate::discoverers::{MonitoringMode, ProcessDiscoverer, run_blocking};
use crate::utils::command::CommandRunner;
use crate::utils::errors::MonitoringError;
use crate::utils::procnet::SocketTable;

/// Finds the processes listening on a TCP port.
///
/// The socket tables are consulted first. When they yield nothing, usually
/// because the listener belongs to another user, the port lookup utility
/// (`lsof -ti :<port>`) is asked instead.
pub struct PortDiscoverer {
    port: u16,
    sockets: Arc<dyn SocketTable>,
    runner: Arc<dyn CommandRunner>,
    fallback_program: String,
}

impl PortDiscoverer {
    pub fn new(port: u16, sockets: Arc<dyn SocketTable>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            port,
            sockets,
            runner,
            fallback_program: DEFAULT_PORT_LOOKUP_PROGRAM.to_string(),
        }
    }

    pub fn with_fallback_program(mut self, program: impl Into<String>) -> Self {
        self.fallback_program = program.into();
        self
    }

    async fn lookup_with_fallback(&self) -> Result<BTreeSet<u32>, MonitoringError> {
        let target = format!(":{}", self.port);
        let output = self
            .runner
            .run(&self.fallback_program, &["-ti", target.as_str()])
            .await?;

        // lsof exits with 1 when nothing holds the port
        if !output.success {
            return Ok(BTreeSet::new());
        }
        Ok(parse_pid_lines(&output.stdout))
    }
}

#[async_trait]
impl ProcessDiscoverer for PortDiscoverer {
    async fn discover(&self) -> Result<BTreeSet<u32>, MonitoringError> {
        let sockets = Arc::clone(&self.sockets);
        let port = self.port;
        match run_blocking(move || sockets.listening_pids(port)).await? {
            Ok(pids) if !pids.is_empty() => return Ok(pids),
            Ok(_) => {}
            Err(e) => debug!("Socket table lookup for port {} failed: {}", self.port, e),
        }
        self.lookup_with_fallback().await
    }

    fn mode(&self) -> MonitoringMode {
        MonitoringMode::Port
    }

    fn describe(&self) -> String {
        format!("processes on port {}", self.port)
    }
}

/// One pid per line; blank and unparsable lines are skipped.
pub fn parse_pid_lines(text: &str) -> BTreeSet<u32> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.parse().ok())
        .collect()
}
