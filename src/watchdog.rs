//! Watchdog Runtime
//!
//! Wires the detector, registry, scheduler and coordinator together and drives
//! them from tokio timers until shutdown.

use crate::actions::ActionCoordinator;
use crate::clock::{elapsed, Clock, SystemClock};
use crate::config::{AppSettings, ConfigSource, ConfigStore};
use crate::controller::{NativeController, ProcessControl};
use crate::events::EventBus;
use crate::logger::{self, ActivityOptions};
use crate::media::MediaUsageDetector;
use crate::notification::{self, AlertFactory, TracingAlerts};
use crate::registry::ProcessRegistry;
use crate::scheduler::{CycleReport, DetectionScheduler};
use crate::sys::{self, ConsentStore, ModuleInspector, ProcessTable};
use anyhow::Result;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often due auto-resumes are checked
const RESUME_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// How often the config file's modification time is checked
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// Line commands read from stdin in console mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `resume <PID>`
    Resume(u32),
    /// `status`
    Status,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = match words.next()?.to_ascii_lowercase().as_str() {
            "resume" => Self::Resume(words.next()?.parse().ok()?),
            "status" => Self::Status,
            _ => return None,
        };
        words.next().is_none().then_some(command)
    }
}

pub struct Watchdog {
    config: Arc<ConfigStore>,
    registry: Arc<ProcessRegistry>,
    detector: Arc<MediaUsageDetector>,
    coordinator: Arc<ActionCoordinator>,
    scheduler: Arc<DetectionScheduler>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    detailed_logging: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Watchdog {
    /// Watchdog on the native OS backends
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let table = sys::native_process_table();
        let controller: Arc<dyn ProcessControl> = Arc::new(NativeController::new(table.clone()));
        Self::with_parts(
            config,
            table,
            sys::native_consent_store(),
            sys::native_module_inspector(),
            controller,
            Arc::new(TracingAlerts),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        config: Arc<ConfigStore>,
        table: Arc<dyn ProcessTable>,
        store: Arc<dyn ConsentStore>,
        modules: Arc<dyn ModuleInspector>,
        controller: Arc<dyn ProcessControl>,
        alerts: Arc<dyn AlertFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let source: Arc<dyn ConfigSource> = config.clone();
        let detailed_logging = Arc::new(AtomicBool::new(
            source.current().settings.enable_detailed_logging,
        ));
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ProcessRegistry::new());
        let detector = Arc::new(MediaUsageDetector::new(
            table.clone(),
            store,
            modules,
            clock.clone(),
            source.current().settings.detector.clone(),
        ));
        let coordinator = Arc::new(ActionCoordinator::new(
            registry.clone(),
            controller,
            alerts,
            bus.clone(),
            clock.clone(),
            source.clone(),
        ));
        let scheduler = Arc::new(DetectionScheduler::new(
            table,
            detector.clone(),
            registry.clone(),
            coordinator.clone(),
            bus.clone(),
            clock.clone(),
            source,
        ));

        Self {
            config,
            registry,
            detector,
            coordinator,
            scheduler,
            bus,
            clock,
            detailed_logging,
            shutdown: watch::channel(false).0,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &Arc<MediaUsageDetector> {
        &self.detector
    }

    pub fn coordinator(&self) -> &Arc<ActionCoordinator> {
        &self.coordinator
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Switch the activity log worker reads for near-limit entries
    pub fn detailed_logging(&self) -> Arc<AtomicBool> {
        self.detailed_logging.clone()
    }

    /// Runs a single detection cycle on the calling thread
    pub fn scan_once(&self) -> Option<CycleReport> {
        self.scheduler.tick()
    }

    /// Pushes reloaded settings into the running parts
    pub fn apply_settings(&self, settings: &AppSettings) {
        self.detector.apply_settings(&settings.detector);
        self.detailed_logging
            .store(settings.enable_detailed_logging, Ordering::Relaxed);
    }

    /// Runs a console command; false if it had no effect
    pub fn execute(&self, command: ConsoleCommand) -> bool {
        match command {
            ConsoleCommand::Resume(pid) => {
                let resumed = self.coordinator.resume_now(pid);
                if !resumed {
                    warn!("PID {} is neither tracked nor suspended", pid);
                }
                resumed
            }
            ConsoleCommand::Status => {
                self.present(usize::MAX);
                true
            }
        }
    }

    /// Asks a running `run` to return
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Drives all timers until `stop` is called. Returns after the in-flight
    /// cycle finished and pending resumes ran.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let settings = self.config.current().settings.clone();
        let mut monitor_interval = settings.monitor_interval();
        let mut ui_refresh = settings.ui_refresh();

        let mut detection = skipping_interval(monitor_interval);
        let mut resumes = skipping_interval(RESUME_CHECK_INTERVAL);
        let mut reload = skipping_interval(CONFIG_RELOAD_INTERVAL);
        let mut presentation = skipping_interval(ui_refresh);

        let mut in_flight: Option<JoinHandle<Option<CycleReport>>> = None;
        let mut last_tracked = 0usize;

        info!(
            "Watchdog running (detection every {:?}, status every {:?})",
            monitor_interval, ui_refresh
        );

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
                _ = detection.tick() => {
                    if self.scheduler.in_cycle() {
                        debug!("Detection tick skipped, cycle still running");
                        continue;
                    }
                    let scheduler = self.scheduler.clone();
                    in_flight = Some(tokio::task::spawn_blocking(move || scheduler.tick()));
                }
                _ = resumes.tick() => {
                    let coordinator = self.coordinator.clone();
                    let resumed = tokio::task::spawn_blocking(move || coordinator.run_due_resumes()).await;
                    if let Err(e) = resumed {
                        error!("Resume check failed: {}", e);
                    }
                }
                _ = reload.tick() => {
                    match self.config.reload_if_changed() {
                        Ok(true) => {
                            let settings = self.config.current().settings.clone();
                            self.apply_settings(&settings);
                            if settings.monitor_interval() != monitor_interval {
                                monitor_interval = settings.monitor_interval();
                                detection = skipping_interval(monitor_interval);
                                info!("Detection interval changed to {:?}", monitor_interval);
                            }
                            if settings.ui_refresh() != ui_refresh {
                                ui_refresh = settings.ui_refresh();
                                presentation = skipping_interval(ui_refresh);
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!("Config reload failed, keeping previous: {}", e),
                    }
                }
                _ = presentation.tick() => {
                    last_tracked = self.present(last_tracked);
                }
            }
        }

        if let Some(cycle) = in_flight {
            match cycle.await {
                Ok(Some(report)) => debug!("Last cycle finished: {:?}", report),
                Ok(None) => {}
                Err(e) => error!("Detection cycle failed: {}", e),
            }
        }

        let coordinator = self.coordinator.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || coordinator.shutdown()).await {
            error!("Coordinator shutdown failed: {}", e);
        }
        Ok(())
    }

    /// Logs the tracked set; returns the tracked count
    fn present(&self, last_tracked: usize) -> usize {
        let snapshot = self.registry.snapshot();
        let now = self.clock.now();
        for process in snapshot.values() {
            let runtime = elapsed(process.start_time, now);
            debug!(
                "[{}] {} ({}) {} {}s/{}s",
                process.pid,
                process.display_name,
                process.name,
                process.status.as_str(),
                runtime.as_secs(),
                process.config.max_runtime.as_secs()
            );
        }
        if snapshot.len() != last_tracked {
            info!("Tracking {} process(es)", snapshot.len());
        }
        snapshot.len()
    }
}

fn skipping_interval(period: Duration) -> Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

/// Runs the native watchdog until CTRL+C
pub fn run_until_ctrl_c(config: Arc<ConfigStore>, console_output: bool) -> Result<()> {
    info!("Starting watchdog...");

    let settings = config.current().settings.clone();
    let watchdog = Arc::new(Watchdog::new(config.clone()));

    // Start activity logger thread
    let options = ActivityOptions {
        path: logger::activity_log_path(),
        console_output,
        detailed: watchdog.detailed_logging(),
        retention_days: settings.auto_clean_logs.then_some(settings.log_retention_days),
    };
    let log_rx = watchdog.bus().subscribe();
    let logger_handle = thread::spawn(move || logger::activity_worker(log_rx, options));

    // ctrlc handler - can fail with windows_subsystem="windows"
    let stopper = watchdog.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("CTRL+C received, shutting down...");
        stopper.stop();
    }) {
        warn!("Could not install CTRL+C handler: {}", e);
    }

    if console_output {
        spawn_console_reader(watchdog.clone());
    }

    notification::show_start_notification(&config.current());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(watchdog.clone().run());

    // Let the logger drain and finish
    watchdog.bus().close();
    match logger_handle.join() {
        Ok(written) => info!("Activity log closed, {} entries written", written),
        Err(_) => error!("Activity logger thread panicked"),
    }

    notification::show_stop_notification();
    info!("Watchdog ended");
    result
}

/// Reads console commands until stdin closes. Detached, the blocking read
/// never returns on its own.
fn spawn_console_reader(watchdog: Arc<Watchdog>) {
    info!("Console commands: resume <PID>, status");
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match ConsoleCommand::parse(&line) {
                Some(command) => {
                    watchdog.execute(command);
                }
                None => warn!("Unknown command: {}", line.trim()),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessConfig, WatchConfig};
    use crate::events::WatchEvent;
    use crate::registry::ProcessStatus;
    use crate::testing::{
        FakeConsentStore, FakeModules, FakeProcessTable, ManualClock, RecordingAlerts,
        RecordingController,
    };

    fn watchdog(table: Arc<FakeProcessTable>) -> Arc<Watchdog> {
        let config = WatchConfig::empty().with_process(ProcessConfig::new("cap.exe"));
        Arc::new(Watchdog::with_parts(
            Arc::new(ConfigStore::in_memory(config)),
            table.clone(),
            Arc::new(FakeConsentStore::default()),
            Arc::new(FakeModules::default()),
            Arc::new(RecordingController::with_table(table)),
            Arc::new(RecordingAlerts::default()),
            Arc::new(ManualClock::new()),
        ))
    }

    #[test]
    fn scan_once_tracks_configured_processes() {
        let table = Arc::new(FakeProcessTable::default());
        table.spawn(100, "cap.exe");
        table.spawn(200, "other.exe");
        let watchdog = watchdog(table);

        let report = watchdog.scan_once().unwrap();
        assert_eq!(report.detected, 1);
        assert!(watchdog.registry().contains(100));
        assert!(!watchdog.registry().contains(200));
    }

    #[test]
    fn console_commands_parse() {
        assert_eq!(ConsoleCommand::parse("resume 42"), Some(ConsoleCommand::Resume(42)));
        assert_eq!(ConsoleCommand::parse("  RESUME   7 "), Some(ConsoleCommand::Resume(7)));
        assert_eq!(ConsoleCommand::parse("status"), Some(ConsoleCommand::Status));
        assert_eq!(ConsoleCommand::parse("resume"), None);
        assert_eq!(ConsoleCommand::parse("resume abc"), None);
        assert_eq!(ConsoleCommand::parse("resume 1 2"), None);
        assert_eq!(ConsoleCommand::parse("quit"), None);
    }

    #[test]
    fn resume_command_goes_through_the_coordinator() {
        let table = Arc::new(FakeProcessTable::default());
        table.spawn(100, "cap.exe");
        let watchdog = watchdog(table);
        let events = watchdog.bus().subscribe();
        watchdog.scan_once();

        let process = watchdog.registry().get(100).unwrap();
        watchdog.coordinator().handle(&WatchEvent::ProcessExceededLimit {
            action: process.config.action_type,
            process,
        });
        assert_eq!(watchdog.registry().get(100).unwrap().status, ProcessStatus::Suspended);

        assert!(watchdog.execute(ConsoleCommand::Resume(100)));
        assert_eq!(watchdog.registry().get(100).unwrap().status, ProcessStatus::Running);
        assert!(events
            .try_iter()
            .any(|e| matches!(e, WatchEvent::ProcessResumed { manual: true, .. })));
        assert!(!watchdog.execute(ConsoleCommand::Resume(999)));
    }

    #[test]
    fn reloaded_settings_reach_the_activity_log_switch() {
        let watchdog = watchdog(Arc::new(FakeProcessTable::default()));
        let detailed = watchdog.detailed_logging();
        let mut settings = AppSettings::default();

        settings.enable_detailed_logging = false;
        watchdog.apply_settings(&settings);
        assert!(!detailed.load(Ordering::Relaxed));

        settings.enable_detailed_logging = true;
        watchdog.apply_settings(&settings);
        assert!(detailed.load(Ordering::Relaxed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_detects_then_stops_on_shutdown() {
        let table = Arc::new(FakeProcessTable::default());
        table.spawn(100, "cap.exe");
        let watchdog = watchdog(table);
        let events = watchdog.bus().subscribe();

        let running = tokio::spawn(watchdog.clone().run());

        let first = tokio::task::spawn_blocking(move || events.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind(), "Detected");
        assert_eq!(first.pid(), 100);

        watchdog.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!watchdog.scheduler.in_cycle());
    }
}
