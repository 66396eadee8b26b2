use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use log::{error, info};
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::discoverers::MonitoringMode;
use crate::shutdown::ShutdownController;
use crate::utils::errors::MonitoringError;

/// One aggregated observation of the whole process group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    pub timestamp: NaiveDateTime,
    /// Seconds since the session started
    pub elapsed: f64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub process_count: usize,
    pub monitoring_mode: MonitoringMode,
}

impl SampleRecord {
    pub fn new(
        elapsed: f64,
        memory_mb: f64,
        cpu_percent: f64,
        process_count: usize,
        monitoring_mode: MonitoringMode,
    ) -> Self {
        Self {
            timestamp: Local::now().naive_local(),
            elapsed,
            memory_mb,
            cpu_percent,
            process_count,
            monitoring_mode,
        }
    }
}

/// Aggregates over a recorded session.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionSummary {
    pub samples: usize,
    pub peak_memory_mb: f64,
    pub mean_cpu_percent: f64,
    pub duration_seconds: f64,
}

/// Owns the sample sequence and writes it out at the end of the run.
///
/// The recorder flushes itself on drop when no explicit flush happened,
/// so a run that unwinds still leaves its samples on disk.
pub struct SessionRecorder {
    output: PathBuf,
    samples: Vec<SampleRecord>,
    flushes: usize,
}

impl SessionRecorder {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            samples: Vec::new(),
            flushes: 0,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    /// Appends a record, clamping `elapsed` so the sequence never goes backwards.
    pub fn push(&mut self, mut record: SampleRecord) {
        if let Some(last) = self.samples.last() {
            record.elapsed = record.elapsed.max(last.elapsed);
        }
        self.samples.push(record);
    }

    /// Number of write attempts so far, failed ones included.
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    /// Writes every sample as a JSON array, replacing the output file.
    pub fn flush(&mut self) -> Result<(), MonitoringError> {
        self.flushes += 1;
        let json = serde_json::to_string_pretty(&self.samples)?;
        fs::write(&self.output, json).map_err(|source| MonitoringError::OutputError {
            path: self.output.clone(),
            source,
        })?;
        info!(
            "Memory and CPU data saved to {} ({} data points)",
            self.output.display(),
            self.samples.len()
        );
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        if self.samples.is_empty() {
            return SessionSummary::default();
        }
        let count = self.samples.len();
        let peak_memory_mb = self
            .samples
            .iter()
            .map(|s| s.memory_mb)
            .fold(0.0, f64::max);
        let mean_cpu_percent =
            self.samples.iter().map(|s| s.cpu_percent).sum::<f64>() / count as f64;
        let duration_seconds = self.samples[count - 1].elapsed - self.samples[0].elapsed;

        SessionSummary {
            samples: count,
            peak_memory_mb,
            mean_cpu_percent,
            duration_seconds,
        }
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        if self.flushes == 0 {
            if let Err(e) = self.flush() {
                error!("Error saving data: {}", e);
            }
        }
    }
}

/// Root object of one monitoring run.
pub struct MonitoringSession {
    start_time: Instant,
    interval: Duration,
    mode: MonitoringMode,
    shutdown: ShutdownController,
    recorder: SessionRecorder,
}

impl MonitoringSession {
    pub fn new(config: &MonitorConfig, shutdown: ShutdownController) -> Self {
        Self {
            start_time: Instant::now(),
            interval: config.interval,
            mode: config.mode,
            shutdown,
            recorder: SessionRecorder::new(config.output.clone()),
        }
    }

    /// Moves the start of the session, e.g. to resume an elapsed clock.
    pub fn with_start_time(mut self, start_time: Instant) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mode(&self) -> MonitoringMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_running()
    }

    pub fn shutdown(&self) -> &ShutdownController {
        &self.shutdown
    }

    pub fn record(&mut self, record: SampleRecord) {
        self.recorder.push(record);
    }

    pub fn samples(&self) -> &[SampleRecord] {
        self.recorder.samples()
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut SessionRecorder {
        &mut self.recorder
    }
}
