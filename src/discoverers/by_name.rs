use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::config::GUNICORN_PROCESS_NAME;
use crate::discoverers::{MonitoringMode, ProcessDiscoverer, run_blocking};
use crate::utils::errors::MonitoringError;
use crate::utils::procnet::SocketTable;
use crate::utils::psutils::{ProcessInfo, list_processes};

const BIND_FLAGS: [&str; 4] = ["-b", "--bind", "-p", "--port"];
// gunicorn's -p is --pid FILE
const GUNICORN_BIND_FLAGS: [&str; 2] = ["-b", "--bind"];

/// Matches processes by name or command line, corroborated by the port.
///
/// A name match alone is too weak: editors, build tools and shells mention
/// the service name too. When a port is configured a candidate must also
/// listen on it, or pass it to a bind flag on its command line.
#[derive(Clone)]
pub struct ByNameDiscoverer {
    pattern: String,
    port: Option<u16>,
    mode: MonitoringMode,
    sockets: Arc<dyn SocketTable>,
    own_pid: u32,
}

impl ByNameDiscoverer {
    pub fn new(
        pattern: &str,
        port: Option<u16>,
        mode: MonitoringMode,
        sockets: Arc<dyn SocketTable>,
    ) -> Self {
        Self {
            pattern: pattern.to_lowercase(),
            port,
            mode,
            sockets,
            own_pid: std::process::id(),
        }
    }

    fn bind_flags(&self) -> &'static [&'static str] {
        if self.pattern.contains(GUNICORN_PROCESS_NAME) {
            &GUNICORN_BIND_FLAGS
        } else {
            &BIND_FLAGS
        }
    }

    /// Pids among `processes` that belong to the target service.
    ///
    /// The monitor and its ancestors are never selected: a `sudo` or shell
    /// wrapper repeats the target name and port on its own command line.
    pub fn select(&self, processes: &[ProcessInfo]) -> BTreeSet<u32> {
        let excluded = lineage(processes, self.own_pid);
        let candidates: Vec<&ProcessInfo> = processes
            .iter()
            .filter(|process| !excluded.contains(&process.pid))
            .filter(|process| matches_name(process, &self.pattern))
            .collect();

        let Some(port) = self.port else {
            return candidates.iter().map(|process| process.pid).collect();
        };

        let candidate_pids: BTreeSet<u32> = candidates.iter().map(|process| process.pid).collect();
        let listening = self
            .sockets
            .listening_among(port, &candidate_pids)
            .unwrap_or_else(|e| {
                debug!("Socket lookup for port {} failed: {}", port, e);
                BTreeSet::new()
            });

        candidates
            .into_iter()
            .filter(|process| {
                listening.contains(&process.pid)
                    || cmdline_binds_port(&process.cmd, port, self.bind_flags())
            })
            .map(|process| process.pid)
            .collect()
    }

    fn discover_blocking(&self) -> Result<BTreeSet<u32>, MonitoringError> {
        let processes = list_processes();
        if processes.is_empty() {
            return Err(MonitoringError::ProcessDiscoveryError(
                "No processes found on system".to_string(),
            ));
        }
        Ok(self.select(&processes))
    }
}

#[async_trait]
impl ProcessDiscoverer for ByNameDiscoverer {
    async fn discover(&self) -> Result<BTreeSet<u32>, MonitoringError> {
        let discoverer = self.clone();
        run_blocking(move || discoverer.discover_blocking()).await?
    }

    fn mode(&self) -> MonitoringMode {
        self.mode
    }

    fn describe(&self) -> String {
        match self.port {
            Some(port) => format!("'{}' processes on port {}", self.pattern, port),
            None => format!("'{}' processes", self.pattern),
        }
    }
}

/// `pid` and every ancestor reachable through the parent links in `processes`.
fn lineage(processes: &[ProcessInfo], pid: u32) -> BTreeSet<u32> {
    let parents: HashMap<u32, u32> = processes
        .iter()
        .filter_map(|process| Some((process.pid, process.parent?)))
        .collect();

    let mut lineage = BTreeSet::from([pid]);
    let mut current = pid;
    while let Some(&parent) = parents.get(&current) {
        if !lineage.insert(parent) {
            break;
        }
        current = parent;
    }
    lineage
}

/// Case-insensitive substring match on the executable name or full command line.
/// `pattern` must already be lowercase.
pub fn matches_name(process: &ProcessInfo, pattern: &str) -> bool {
    process.name.to_lowercase().contains(pattern)
        || process.cmd.join(" ").to_lowercase().contains(pattern)
}

/// Whether the arguments pass `port` to one of `flags`, as in
/// `--bind 0.0.0.0:8000`, `-b :8000`, `--port=8000` or `-p 8000`.
pub fn cmdline_binds_port(args: &[String], port: u16, flags: &[&str]) -> bool {
    let port = port.to_string();
    let value_matches = |value: &str| {
        value == port
            || value
                .rsplit_once(':')
                .is_some_and(|(_, bound)| bound == port)
    };

    args.iter().enumerate().any(|(i, arg)| {
        if let Some((flag, value)) = arg.split_once('=') {
            if flags.contains(&flag) && value_matches(value) {
                return true;
            }
        }
        flags.contains(&arg.as_str()) && args.get(i + 1).is_some_and(|value| value_matches(value))
    })
}
