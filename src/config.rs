use std::path::PathBuf;
use std::time::Duration;

use crate::discoverers::MonitoringMode;
use crate::utils::errors::MonitoringError;

pub const DEFAULT_INTERVAL_SECS: f64 = 0.1;
pub const DEFAULT_PM_PROGRAM: &str = "pm2";
pub const DEFAULT_PORT_LOOKUP_PROGRAM: &str = "lsof";
pub const GUNICORN_PROCESS_NAME: &str = "gunicorn";

/// Everything a monitoring run needs, as handed over by the CLI.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Listening port of the service. Required for port mode, optional
    /// corroboration for by-name modes, unused for the process manager.
    pub port: Option<u16>,
    pub output: PathBuf,
    pub interval: Duration,
    pub mode: MonitoringMode,
    /// Managed app name filter for the process manager mode
    pub name_filter: Option<String>,
    /// Substring matched against process names in by-name modes
    pub process_name: Option<String>,
    pub pm_program: String,
    pub port_lookup_program: String,
}

impl MonitorConfig {
    pub fn new(output: impl Into<PathBuf>, mode: MonitoringMode) -> Self {
        Self {
            port: None,
            output: output.into(),
            interval: Duration::from_secs_f64(DEFAULT_INTERVAL_SECS),
            mode,
            name_filter: None,
            process_name: None,
            pm_program: DEFAULT_PM_PROGRAM.to_string(),
            port_lookup_program: DEFAULT_PORT_LOOKUP_PROGRAM.to_string(),
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    /// Sets the sampling interval, rejecting zero, negative, non-finite and
    /// unrepresentably large values.
    pub fn with_interval_secs(mut self, seconds: f64) -> Result<Self, MonitoringError> {
        let invalid = |reason: String| {
            MonitoringError::Other(format!(
                "Sampling interval must be a positive number of seconds, got {}: {}",
                seconds, reason
            ))
        };
        if seconds <= 0.0 {
            return Err(invalid("not positive".to_string()));
        }
        self.interval = Duration::try_from_secs_f64(seconds).map_err(|e| invalid(e.to_string()))?;
        Ok(self)
    }

    pub fn with_name_filter(mut self, name_filter: Option<String>) -> Self {
        self.name_filter = name_filter;
        self
    }

    pub fn with_process_name(mut self, process_name: Option<String>) -> Self {
        self.process_name = process_name;
        self
    }

    pub fn with_pm_program(mut self, program: impl Into<String>) -> Self {
        self.pm_program = program.into();
        self
    }

    /// Target substring for by-name discovery; gunicorn mode presets it.
    pub fn target_process_name(&self) -> Option<&str> {
        match (self.process_name.as_deref(), self.mode) {
            (Some(name), _) => Some(name),
            (None, MonitoringMode::Gunicorn) => Some(GUNICORN_PROCESS_NAME),
            (None, _) => None,
        }
    }

    /// Checks that the selected mode has what it needs.
    pub fn validate(&self) -> Result<(), MonitoringError> {
        match self.mode {
            MonitoringMode::Port if self.port.is_none() => Err(MonitoringError::Other(
                "A port is required in port mode".to_string(),
            )),
            MonitoringMode::ByName
                if self.target_process_name().is_none_or(|name| name.trim().is_empty()) =>
            {
                Err(MonitoringError::Other(
                    "A process name is required in by-name mode".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}
