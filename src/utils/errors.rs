use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("Process discovery error: {0}")]
    ProcessDiscoveryError(String),
    #[error("Process {0} no longer exists")]
    ProcessGone(u32),
    #[error("Access denied to process {0}")]
    AccessDenied(u32),
    #[error("Failed to run {program}: {reason}")]
    CommandError { program: String, reason: String },
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Signal handling error: {0}")]
    SignalError(String),
    #[error("Failed to write {path:?}: {source}")]
    OutputError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Other error: {0}")]
    Other(String),
}

impl MonitoringError {
    /// Errors a tick absorbs: the attempt is dropped and retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MonitoringError::ProcessDiscoveryError(_)
                | MonitoringError::ProcessGone(_)
                | MonitoringError::AccessDenied(_)
                | MonitoringError::CommandError { .. }
                | MonitoringError::ParseError(_)
        )
    }
}
