use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::debug;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use users::UsersCache;

use crate::utils::errors::MonitoringError;
use crate::utils::psutils::process_owner;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Resident memory and CPU usage of one process at one reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessUsage {
    pub memory_mb: f64,
    /// Percentage of one core since the previous reading of the same handle
    pub cpu_percent: f64,
}

/// Live handle to an OS process carrying its own CPU accounting baseline.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    fn read(&mut self) -> Result<ProcessUsage, MonitoringError>;
}

/// Opens process handles. Opening takes the baseline CPU reading.
pub trait ProcessProbe: Send {
    fn open(&mut self, pid: u32) -> Result<Box<dyn ProcessHandle>, MonitoringError>;
}

/// [`ProcessProbe`] backed by sysinfo.
///
/// Every handle owns a `System` restricted to its pid, so the CPU delta is
/// measured between two refreshes of that handle only. Dropping the handle
/// drops the baseline with it.
#[derive(Default)]
pub struct SysinfoProbe;

impl ProcessProbe for SysinfoProbe {
    fn open(&mut self, pid: u32) -> Result<Box<dyn ProcessHandle>, MonitoringError> {
        let mut handle = SysinfoHandle {
            pid: Pid::from_u32(pid),
            system: System::new(),
        };
        let refresh_kind = ProcessRefreshKind::nothing()
            .with_cpu()
            .with_memory()
            .with_user(UpdateKind::OnlyIfNotSet);
        let process = handle.refresh(refresh_kind)?;
        debug!(
            "Opened pid {} ({}) owned by {}",
            pid,
            process.name().to_string_lossy(),
            process_owner(process, &UsersCache::new())
        );
        Ok(Box::new(handle))
    }
}

struct SysinfoHandle {
    pid: Pid,
    system: System,
}

impl SysinfoHandle {
    fn refresh(&mut self, refresh_kind: ProcessRefreshKind) -> Result<&Process, MonitoringError> {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::Some(&[self.pid]), true, refresh_kind);
        self.system
            .process(self.pid)
            .ok_or(MonitoringError::ProcessGone(self.pid.as_u32()))
    }
}

impl ProcessHandle for SysinfoHandle {
    fn pid(&self) -> u32 {
        self.pid.as_u32()
    }

    fn read(&mut self) -> Result<ProcessUsage, MonitoringError> {
        let process = self.refresh(ProcessRefreshKind::nothing().with_cpu().with_memory())?;
        Ok(ProcessUsage {
            memory_mb: process.memory() as f64 / BYTES_PER_MB,
            cpu_percent: process.cpu_usage() as f64,
        })
    }
}

/// Cache entry: a handle plus whether it was opened during the current tick.
///
/// Entries only exist for handles whose baseline reading succeeded in
/// [`ProcessProbe::open`], so every cached handle has a CPU baseline.
pub struct CachedHandle {
    handle: Box<dyn ProcessHandle>,
    opened_this_tick: bool,
}

impl CachedHandle {
    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    /// Opened during the current tick, so its CPU delta only covers the
    /// time since the baseline reading.
    pub fn opened_this_tick(&self) -> bool {
        self.opened_this_tick
    }

    pub fn read(&mut self) -> Result<ProcessUsage, MonitoringError> {
        self.handle.read()
    }
}

/// What a refresh did to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub reused: usize,
    pub opened: usize,
    pub dropped: usize,
    pub skipped: usize,
}

/// Process handles kept across ticks, keyed by pid.
pub struct HandleCache {
    probe: Box<dyn ProcessProbe>,
    handles: BTreeMap<u32, CachedHandle>,
}

impl HandleCache {
    pub fn new(probe: Box<dyn ProcessProbe>) -> Self {
        Self {
            probe,
            handles: BTreeMap::new(),
        }
    }

    /// Replaces the cache contents with handles for `discovered`.
    ///
    /// Known pids keep their handle and baseline. Unknown pids get a new
    /// handle; pids whose process already exited are skipped for this tick.
    /// Handles for pids no longer discovered are dropped.
    pub fn refresh(&mut self, discovered: &BTreeSet<u32>) -> RefreshReport {
        let mut report = RefreshReport::default();
        let mut previous = std::mem::take(&mut self.handles);

        for &pid in discovered {
            if let Some(mut cached) = previous.remove(&pid) {
                cached.opened_this_tick = false;
                self.handles.insert(pid, cached);
                report.reused += 1;
                continue;
            }

            match self.probe.open(pid) {
                Ok(handle) => {
                    self.handles.insert(
                        pid,
                        CachedHandle {
                            handle,
                            opened_this_tick: true,
                        },
                    );
                    report.opened += 1;
                }
                Err(e) => {
                    debug!("Skipping pid {} this tick: {}", pid, e);
                    report.skipped += 1;
                }
            }
        }

        report.dropped = previous.len();
        if !previous.is_empty() {
            debug!("Dropped handles for pids {}", previous.keys().join(", "));
        }
        report
    }

    /// Forgets a handle whose process disappeared mid-tick.
    pub fn evict(&mut self, pid: u32) -> bool {
        self.handles.remove(&pid).is_some()
    }

    pub fn handles_mut(&mut self) -> impl Iterator<Item = &mut CachedHandle> {
        self.handles.values_mut()
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.handles.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
