use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use procmon::config::{DEFAULT_INTERVAL_SECS, DEFAULT_PM_PROGRAM, MonitorConfig};
use procmon::discoverers::{MonitoringMode, build_discoverer};
use procmon::handle_cache::SysinfoProbe;
use procmon::sampler::Sampler;
use procmon::session::{MonitoringSession, SessionSummary};
use procmon::shutdown::ShutdownController;
use procmon::utils;
use procmon::utils::command::TokioCommandRunner;
use procmon::utils::errors::MonitoringError;
use procmon::utils::procnet::ProcSocketTable;

/// Monitor memory and CPU usage of the processes behind a service.
#[derive(Debug, Parser)]
#[command(name = "procmon", version)]
struct Cli {
    /// Output JSON file
    output_file: PathBuf,

    /// Port the service listens on (required in port mode)
    #[arg(short, long)]
    port: Option<u16>,

    /// Sampling interval in seconds
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    interval: f64,

    /// How the service's processes are discovered
    #[arg(long, value_enum, default_value_t = MonitoringMode::Port)]
    mode: MonitoringMode,

    /// Shorthand for --mode pm2
    #[arg(long, conflicts_with = "mode")]
    pm2: bool,

    /// Only monitor process manager apps with this name
    #[arg(long)]
    name: Option<String>,

    /// Substring matched against process names in by-name modes
    #[arg(long)]
    process_name: Option<String>,

    /// Process manager executable
    #[arg(long, default_value = DEFAULT_PM_PROGRAM)]
    pm_program: String,
}

impl Cli {
    fn into_config(self) -> Result<MonitorConfig, MonitoringError> {
        let mode = if self.pm2 { MonitoringMode::Pm2 } else { self.mode };
        let config = MonitorConfig::new(self.output_file, mode)
            .with_port(self.port)
            .with_interval_secs(self.interval)?
            .with_name_filter(self.name)
            .with_process_name(self.process_name)
            .with_pm_program(self.pm_program);
        config.validate()?;
        Ok(config)
    }
}

async fn run(cli: Cli) -> Result<SessionSummary, MonitoringError> {
    let config = cli.into_config()?;

    let shutdown = ShutdownController::new();
    let _signals = shutdown.listen_for_signals()?;

    let discoverer = build_discoverer(
        &config,
        Arc::new(TokioCommandRunner::default()),
        Arc::new(ProcSocketTable::default()),
    )?;
    let session = MonitoringSession::new(&config, shutdown);
    let mut sampler = Sampler::new(session, discoverer, Box::new(SysinfoProbe));
    sampler.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    utils::logger::setup_logger();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(summary) => {
            info!(
                "Recorded {} samples over {:.1}s, peak memory {:.2}MB, mean CPU {:.2}%",
                summary.samples,
                summary.duration_seconds,
                summary.peak_memory_mb,
                summary.mean_cpu_percent
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Monitoring failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
