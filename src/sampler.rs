use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::discoverers::ProcessDiscoverer;
use crate::handle_cache::{HandleCache, ProcessProbe};
use crate::session::{MonitoringSession, SampleRecord, SessionSummary};
use crate::utils::errors::MonitoringError;

/// Granularity of the inter-tick sleep, bounding cancellation latency.
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);
/// Pause before the first readings so CPU deltas span a real interval.
pub const PRIMING_DELAY: Duration = Duration::from_millis(100);
const PRIMING_WINDOW_SECS: f64 = 1.0;
const STARTUP_GRACE_SECS: f64 = 2.0;

/// What a single tick produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Recorded(SampleRecord),
    /// Nothing measured yet, still within the startup grace period
    AwaitingService { elapsed: f64 },
    /// Nothing measured after the grace period; a warning was logged
    ServiceDown { elapsed: f64 },
}

#[derive(Debug, Default)]
struct Totals {
    memory_mb: f64,
    cpu_percent: f64,
    process_count: usize,
}

/// Periodic discover -> refresh -> measure -> record loop.
pub struct Sampler {
    session: MonitoringSession,
    discoverer: Box<dyn ProcessDiscoverer>,
    cache: HandleCache,
}

impl Sampler {
    pub fn new(
        session: MonitoringSession,
        discoverer: Box<dyn ProcessDiscoverer>,
        probe: Box<dyn ProcessProbe>,
    ) -> Self {
        Self {
            session,
            discoverer,
            cache: HandleCache::new(probe),
        }
    }

    pub fn session(&self) -> &MonitoringSession {
        &self.session
    }

    pub fn cache(&self) -> &HandleCache {
        &self.cache
    }

    /// Runs until cancelled, then writes the samples out.
    ///
    /// The flush happens on every exit path of the loop. A loop error takes
    /// precedence over a flush error in the returned result.
    pub async fn run(&mut self) -> Result<SessionSummary, MonitoringError> {
        info!(
            "Monitoring memory and CPU usage for {}...",
            self.discoverer.describe()
        );

        let loop_result = self.run_until_cancelled().await;
        if let Err(e) = &loop_result {
            error!("Error during monitoring: {}", e);
        }

        let recorder = self.session.recorder_mut();
        let flush_result = recorder.flush();
        if let Err(e) = &flush_result {
            error!("Error saving data: {}", e);
        }

        loop_result?;
        flush_result?;
        Ok(self.session.recorder().summary())
    }

    /// Ticks until the shutdown flag clears or a non-transient error occurs.
    pub async fn run_until_cancelled(&mut self) -> Result<(), MonitoringError> {
        while self.session.is_running() {
            let tick_started = Instant::now();
            self.tick().await?;
            // An interval too long to form a deadline sleeps until cancelled
            let deadline = tick_started.checked_add(self.session.interval());
            self.sleep_until(deadline).await;
        }
        Ok(())
    }

    /// One iteration: discover, refresh handles, measure and maybe record.
    pub async fn tick(&mut self) -> Result<TickOutcome, MonitoringError> {
        let elapsed = self.session.elapsed_seconds();
        let priming = elapsed < PRIMING_WINDOW_SECS;

        let pids = self.discover().await?;
        let report = self.cache.refresh(&pids);
        debug!("Tick at {:.1}s: {:?}", elapsed, report);

        if priming && !self.cache.is_empty() {
            tokio::time::sleep(PRIMING_DELAY).await;
        }

        let totals = self.measure(priming)?;

        if totals.process_count > 0 {
            let record = SampleRecord::new(
                elapsed,
                totals.memory_mb,
                totals.cpu_percent,
                totals.process_count,
                self.session.mode(),
            );
            info!(
                "Time: {:.1}s, Memory: {:.2}MB, CPU: {:.2}%, {}: {}",
                elapsed,
                totals.memory_mb,
                totals.cpu_percent,
                self.discoverer.describe(),
                totals.process_count
            );
            self.session.record(record.clone());
            Ok(TickOutcome::Recorded(record))
        } else if elapsed > STARTUP_GRACE_SECS {
            warn!(
                "Time: {:.1}s, No {} found",
                elapsed,
                self.discoverer.describe()
            );
            Ok(TickOutcome::ServiceDown { elapsed })
        } else {
            Ok(TickOutcome::AwaitingService { elapsed })
        }
    }

    async fn discover(&self) -> Result<BTreeSet<u32>, MonitoringError> {
        match self.discoverer.discover().await {
            Ok(pids) => Ok(pids),
            Err(e) if e.is_transient() => {
                debug!("Discovery failed, retrying next tick: {}", e);
                Ok(BTreeSet::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Reads every live handle. Handles opened this tick contribute memory
    /// but no CPU, except while priming where the delay gives them a real
    /// measurement window.
    fn measure(&mut self, priming: bool) -> Result<Totals, MonitoringError> {
        let mut totals = Totals::default();
        let mut gone = Vec::new();

        for handle in self.cache.handles_mut() {
            match handle.read() {
                Ok(usage) => {
                    totals.memory_mb += usage.memory_mb;
                    if priming || !handle.opened_this_tick() {
                        totals.cpu_percent += usage.cpu_percent;
                    }
                    totals.process_count += 1;
                }
                Err(MonitoringError::ProcessGone(pid)) => {
                    debug!("Process {} exited during measurement", pid);
                    gone.push(pid);
                }
                Err(e) if e.is_transient() => {
                    debug!("Skipping pid {}: {}", handle.pid(), e);
                }
                Err(e) => return Err(e),
            }
        }

        for pid in gone {
            self.cache.evict(pid);
        }
        Ok(totals)
    }

    async fn sleep_until(&self, deadline: Option<Instant>) {
        while self.session.is_running() {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    SLEEP_SLICE.min(deadline - now)
                }
                None => SLEEP_SLICE,
            };
            tokio::time::sleep(slice).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::discoverers::MonitoringMode;
    use crate::handle_cache::testing::FakeProcesses;
    use crate::shutdown::ShutdownController;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Discovery results served from a shared, mutable set.
    #[derive(Clone, Default)]
    struct FakeDiscoverer {
        pids: Arc<Mutex<Option<BTreeSet<u32>>>>,
        fatal: Arc<Mutex<bool>>,
    }

    impl FakeDiscoverer {
        fn returning(pids: &[u32]) -> Self {
            let discoverer = Self::default();
            discoverer.set(pids);
            discoverer
        }

        fn set(&self, pids: &[u32]) {
            *self.pids.lock().unwrap() = Some(pids.iter().copied().collect());
        }

        fn fail(&self) {
            *self.pids.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl ProcessDiscoverer for FakeDiscoverer {
        async fn discover(&self) -> Result<BTreeSet<u32>, MonitoringError> {
            if *self.fatal.lock().unwrap() {
                return Err(MonitoringError::Other("internal fault".to_string()));
            }
            self.pids.lock().unwrap().clone().ok_or_else(|| {
                MonitoringError::CommandError {
                    program: "pm2".to_string(),
                    reason: "not found".to_string(),
                }
            })
        }

        fn mode(&self) -> MonitoringMode {
            MonitoringMode::Port
        }

        fn describe(&self) -> String {
            "processes on port 8080".to_string()
        }
    }

    struct Harness {
        dir: TempDir,
        shutdown: ShutdownController,
        discoverer: FakeDiscoverer,
        processes: FakeProcesses,
    }

    impl Harness {
        fn new(pids: &[u32], processes: &[(u32, f64, f64)]) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                shutdown: ShutdownController::new(),
                discoverer: FakeDiscoverer::returning(pids),
                processes: FakeProcesses::with(processes),
            }
        }

        fn output(&self) -> std::path::PathBuf {
            self.dir.path().join("monitor.json")
        }

        fn sampler_started(&self, seconds_ago: u64) -> Sampler {
            let config = MonitorConfig::new(self.output(), MonitoringMode::Port)
                .with_port(Some(8080))
                .with_interval_secs(0.05)
                .unwrap();
            let session = MonitoringSession::new(&config, self.shutdown.clone())
                .with_start_time(Instant::now() - Duration::from_secs(seconds_ago));
            Sampler::new(
                session,
                Box::new(self.discoverer.clone()),
                self.processes.probe(),
            )
        }

        fn written(&self) -> Vec<serde_json::Value> {
            serde_json::from_str(&fs::read_to_string(self.output()).unwrap()).unwrap()
        }
    }

    #[tokio::test]
    // Two discovered pids on the very first tick: both cached and measured
    async fn test_priming_tick_measures_memory_and_cpu() {
        let harness = Harness::new(&[101, 102], &[(101, 10.0, 4.0), (102, 20.0, 6.0)]);
        let mut sampler = harness.sampler_started(0);

        let outcome = sampler.tick().await.unwrap();

        assert_eq!(sampler.cache().len(), 2);
        match outcome {
            TickOutcome::Recorded(record) => {
                assert_eq!(record.process_count, 2);
                assert_eq!(record.memory_mb, 30.0);
                assert_eq!(record.cpu_percent, 10.0);
            }
            other => panic!("Expected a record, got {:?}", other),
        }

        let second = sampler.tick().await.unwrap();
        assert!(matches!(second, TickOutcome::Recorded(ref r) if r.process_count == 2));
        assert_eq!(sampler.session().samples().len(), 2);
    }

    #[tokio::test]
    // A process joining mid-run only contributes memory on its first tick
    async fn test_new_handle_mid_run_is_baseline_only() {
        let harness = Harness::new(&[101], &[(101, 10.0, 4.0), (102, 20.0, 6.0)]);
        let mut sampler = harness.sampler_started(5);

        sampler.tick().await.unwrap();
        harness.discoverer.set(&[101, 102]);

        let TickOutcome::Recorded(joined) = sampler.tick().await.unwrap() else {
            panic!("Expected a record");
        };
        assert_eq!(joined.process_count, 2);
        assert_eq!(joined.memory_mb, 30.0);
        assert_eq!(joined.cpu_percent, 4.0);

        let TickOutcome::Recorded(next) = sampler.tick().await.unwrap() else {
            panic!("Expected a record");
        };
        assert_eq!(next.cpu_percent, 10.0);
    }

    #[tokio::test]
    async fn test_no_processes_within_grace_period_is_silent() {
        let harness = Harness::new(&[], &[]);
        let mut sampler = harness.sampler_started(0);

        let outcome = sampler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::AwaitingService { .. }));
        assert!(sampler.session().samples().is_empty());
    }

    #[tokio::test]
    async fn test_no_processes_after_grace_period_warns() {
        let harness = Harness::new(&[], &[]);
        let mut sampler = harness.sampler_started(3);

        let outcome = sampler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::ServiceDown { elapsed } if elapsed > 2.0));
        assert!(sampler.session().samples().is_empty());
    }

    #[tokio::test]
    async fn test_service_disappearing_does_not_crash() {
        let harness = Harness::new(&[101], &[(101, 10.0, 4.0)]);
        let mut sampler = harness.sampler_started(5);

        sampler.tick().await.unwrap();
        harness.discoverer.set(&[]);
        harness.processes.kill(101);

        let outcome = sampler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::ServiceDown { .. }));
        assert!(sampler.cache().is_empty());
        assert_eq!(sampler.session().samples().len(), 1);
    }

    #[tokio::test]
    // Exit between discovery and measurement reduces the count and evicts
    async fn test_process_exiting_mid_tick_is_skipped() {
        let harness = Harness::new(&[101, 102], &[(101, 10.0, 4.0), (102, 20.0, 6.0)]);
        let mut sampler = harness.sampler_started(5);

        sampler.tick().await.unwrap();
        harness.processes.kill(102);

        let TickOutcome::Recorded(record) = sampler.tick().await.unwrap() else {
            panic!("Expected a record");
        };
        assert_eq!(record.process_count, 1);
        assert_eq!(record.memory_mb, 10.0);
        assert_eq!(sampler.cache().pids().collect::<Vec<_>>(), vec![101]);
    }

    #[tokio::test]
    async fn test_access_denied_is_skipped_but_kept() {
        let harness = Harness::new(&[101, 102], &[(101, 10.0, 4.0), (102, 20.0, 6.0)]);
        harness.processes.deny(102);
        let mut sampler = harness.sampler_started(5);

        let TickOutcome::Recorded(record) = sampler.tick().await.unwrap() else {
            panic!("Expected a record");
        };
        assert_eq!(record.process_count, 1);
        assert_eq!(sampler.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_discovery_failure_degrades_to_empty() {
        let harness = Harness::new(&[101], &[(101, 10.0, 4.0)]);
        let mut sampler = harness.sampler_started(5);
        sampler.tick().await.unwrap();

        harness.discoverer.fail();
        let outcome = sampler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::ServiceDown { .. }));
        assert!(sampler.cache().is_empty());

        harness.discoverer.set(&[101]);
        assert!(matches!(
            sampler.tick().await.unwrap(),
            TickOutcome::Recorded(_)
        ));
    }

    #[tokio::test]
    async fn test_elapsed_is_non_decreasing() {
        let harness = Harness::new(&[101], &[(101, 10.0, 4.0)]);
        let mut sampler = harness.sampler_started(5);
        for _ in 0..5 {
            sampler.tick().await.unwrap();
        }

        let elapsed: Vec<f64> = sampler.session().samples().iter().map(|s| s.elapsed).collect();
        assert_eq!(elapsed.len(), 5);
        assert!(elapsed.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_run_flushes_on_cancellation() {
        let harness = Harness::new(&[101], &[(101, 10.0, 4.0)]);
        let mut sampler = harness.sampler_started(5);
        let shutdown = harness.shutdown.clone();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.request_shutdown();
        });
        let summary = sampler.run().await.unwrap();
        stopper.await.unwrap();

        let written = harness.written();
        assert!(!written.is_empty());
        assert_eq!(written.len(), summary.samples);
        assert_eq!(written[0]["process_count"], 1);
        assert_eq!(written[0]["monitoring_mode"], "port");
    }

    #[tokio::test]
    // Cancellation is honoured within a sleep slice, not the full interval
    async fn test_cancellation_interrupts_long_interval() {
        for interval_secs in [30.0, 1e19] {
            let harness = Harness::new(&[101], &[(101, 10.0, 4.0)]);
            let config = MonitorConfig::new(harness.output(), MonitoringMode::Port)
                .with_port(Some(8080))
                .with_interval_secs(interval_secs)
                .unwrap();
            let session = MonitoringSession::new(&config, harness.shutdown.clone());
            let mut sampler = Sampler::new(
                session,
                Box::new(harness.discoverer.clone()),
                harness.processes.probe(),
            );

            let shutdown = harness.shutdown.clone();
            let stopper = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                shutdown.request_shutdown();
            });

            let started = Instant::now();
            sampler.run().await.unwrap();
            stopper.await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(harness.written().len(), 1);
        }
    }

    #[tokio::test]
    // Two termination signals still end in exactly one write, and dropping
    // the sampler afterwards does not write again
    async fn test_double_termination_signal_flushes_once() {
        let harness = Harness::new(&[101], &[(101, 10.0, 4.0)]);
        let mut sampler = harness.sampler_started(5);
        let listener = harness.shutdown.listen_for_signals().unwrap();

        let pid = std::process::id();
        let signals = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(format!("kill -TERM {pid}; kill -TERM {pid}"))
                .status()
                .await
        };
        let (result, status) = tokio::join!(sampler.run(), signals);
        listener.abort();

        assert!(status.unwrap().success());
        result.unwrap();
        assert!(!harness.shutdown.is_running());
        assert_eq!(sampler.session().recorder().flush_count(), 1);
        assert_eq!(harness.written().len(), sampler.session().samples().len());

        fs::remove_file(harness.output()).unwrap();
        drop(sampler);
        assert!(!harness.output().exists());
    }

    #[tokio::test]
    async fn test_fatal_error_still_flushes_partial_data() {
        let harness = Harness::new(&[101], &[(101, 10.0, 4.0)]);
        let mut sampler = harness.sampler_started(5);
        sampler.tick().await.unwrap();

        *harness.discoverer.fatal.lock().unwrap() = true;
        let result = sampler.run().await;

        assert!(matches!(result, Err(MonitoringError::Other(_))));
        assert_eq!(harness.written().len(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_output_reports_failure() {
        let harness = Harness::new(&[101], &[(101, 10.0, 4.0)]);
        let config = MonitorConfig::new(
            harness.dir.path().join("missing").join("monitor.json"),
            MonitoringMode::Port,
        )
        .with_port(Some(8080));
        let session = MonitoringSession::new(&config, harness.shutdown.clone());
        let mut sampler = Sampler::new(
            session,
            Box::new(harness.discoverer.clone()),
            harness.processes.probe(),
        );

        harness.shutdown.request_shutdown();
        let result = sampler.run().await;
        assert!(matches!(result, Err(MonitoringError::OutputError { .. })));
        assert_eq!(sampler.session().recorder().flush_count(), 1);
    }
}
