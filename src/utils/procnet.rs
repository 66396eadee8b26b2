//! Listening-socket lookup backed by the Linux socket tables.
//!
//! `/proc/net/tcp{,6}` maps listening sockets to inodes, and
//! `/proc/<pid>/fd` maps inodes back to the processes holding them. Only
//! processes whose fd directory is readable by the monitor can be matched;
//! everything else silently drops out, which is why port discovery keeps an
//! external fallback.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::trace;

use crate::utils::errors::MonitoringError;

pub type Ino = u64;

const TCP_LISTEN: u8 = 0x0A;
const SOCKET_TABLES: [&str; 2] = ["tcp", "tcp6"];

/// Network-connection enumeration capability used by the discoverers.
pub trait SocketTable: Send + Sync {
    /// Pids owning a socket in LISTEN state on `port`.
    fn listening_pids(&self, port: u16) -> Result<BTreeSet<u32>, MonitoringError>;

    /// The subset of `candidates` holding a socket listening on `port`.
    fn listening_among(
        &self,
        port: u16,
        candidates: &BTreeSet<u32>,
    ) -> Result<BTreeSet<u32>, MonitoringError>;
}

/// [`SocketTable`] reading procfs.
#[derive(Debug, Clone)]
pub struct ProcSocketTable {
    root: PathBuf,
}

impl Default for ProcSocketTable {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcSocketTable {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Inodes of every TCP socket listening on `port`.
    fn listening_inodes(&self, port: u16) -> Result<HashSet<Ino>, MonitoringError> {
        let mut inodes = HashSet::new();
        let mut readable = false;

        for table in SOCKET_TABLES {
            let path = self.root.join("net").join(table);
            let Ok(file) = File::open(&path) else {
                trace!("Socket table {} is not readable", path.display());
                continue;
            };
            readable = true;
            collect_listening_inodes(BufReader::new(file), port, &mut inodes);
        }

        if !readable {
            return Err(MonitoringError::ProcessDiscoveryError(format!(
                "no socket table readable under {}",
                self.root.display()
            )));
        }
        Ok(inodes)
    }

    /// Socket inodes referenced by the open descriptors of `pid`.
    fn socket_inodes(&self, pid: u32) -> std::io::Result<HashSet<Ino>> {
        let fd_dir = self.root.join(pid.to_string()).join("fd");
        Ok(fs::read_dir(fd_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| fs::read_link(entry.path()).ok())
            .filter_map(|link| parse_socket_link(&link))
            .collect())
    }

    fn pids(&self) -> std::io::Result<Vec<u32>> {
        Ok(fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect())
    }

    /// Pids among `pids` whose descriptors reference one of `inodes`.
    fn owners(&self, inodes: &HashSet<Ino>, pids: impl IntoIterator<Item = u32>) -> BTreeSet<u32> {
        pids.into_iter()
            .filter(|&pid| {
                self.socket_inodes(pid)
                    .map(|owned| !owned.is_disjoint(inodes))
                    .unwrap_or(false)
            })
            .collect()
    }
}

impl SocketTable for ProcSocketTable {
    fn listening_pids(&self, port: u16) -> Result<BTreeSet<u32>, MonitoringError> {
        let inodes = self.listening_inodes(port)?;
        if inodes.is_empty() {
            return Ok(BTreeSet::new());
        }

        let pids = self.pids().map_err(|e| {
            MonitoringError::ProcessDiscoveryError(format!("failed to list processes: {}", e))
        })?;
        Ok(self.owners(&inodes, pids))
    }

    fn listening_among(
        &self,
        port: u16,
        candidates: &BTreeSet<u32>,
    ) -> Result<BTreeSet<u32>, MonitoringError> {
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }
        let inodes = self.listening_inodes(port)?;
        if inodes.is_empty() {
            return Ok(BTreeSet::new());
        }
        Ok(self.owners(&inodes, candidates.iter().copied()))
    }
}

fn collect_listening_inodes<R: BufRead>(reader: R, port: u16, result: &mut HashSet<Ino>) {
    // First line is the column header.
    for line in reader.lines().skip(1) {
        let Ok(line) = line else { break };
        if let Some((local_port, state, inode)) = parse_socket_line(&line) {
            if state == TCP_LISTEN && local_port == port && inode != 0 {
                result.insert(inode);
            }
        }
    }
}

/// Extracts `(local port, state, inode)` from one socket-table row.
pub fn parse_socket_line(line: &str) -> Option<(u16, u8, Ino)> {
    let mut fields = line.split_whitespace();
    let local_address = fields.nth(1)?;
    let state = fields.nth(1)?;
    let inode = fields.nth(5)?;

    let (_, port) = local_address.rsplit_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let state = u8::from_str_radix(state, 16).ok()?;
    let inode = inode.parse::<Ino>().ok()?;
    Some((port, state, inode))
}

/// `socket:[12345]` -> `12345`
pub fn parse_socket_link(link: &Path) -> Option<Ino> {
    link.to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
