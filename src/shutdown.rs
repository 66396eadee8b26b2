use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::info;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;

use crate::utils::errors::MonitoringError;

/// Turns termination signals into a cooperative cancellation flag.
///
/// The flag starts out `true` and is flipped once; the sampler observes it
/// between ticks and during its sliced sleeps. Nothing else is touched from
/// the signal path.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    running: Arc<AtomicBool>,
    signals_received: Arc<AtomicUsize>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            signals_received: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests cancellation. Returns `true` only for the call that flipped the flag.
    pub fn request_shutdown(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    pub fn signals_received(&self) -> usize {
        self.signals_received.load(Ordering::SeqCst)
    }

    /// Installs SIGINT and SIGTERM handlers and forwards them to the flag.
    pub fn listen_for_signals(&self) -> Result<JoinHandle<()>, MonitoringError> {
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| MonitoringError::SignalError(format!("SIGINT handler: {}", e)))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| MonitoringError::SignalError(format!("SIGTERM handler: {}", e)))?;

        let controller = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    received = sigint.recv() => match received {
                        Some(()) => "SIGINT",
                        None => break,
                    },
                    received = sigterm.recv() => match received {
                        Some(()) => "SIGTERM",
                        None => break,
                    },
                };
                controller.signals_received.fetch_add(1, Ordering::SeqCst);
                if controller.request_shutdown() {
                    info!("Received {}, stopping monitoring...", name);
                } else {
                    info!("Received {} while already stopping, ignoring", name);
                }
            }
        }))
    }
}
