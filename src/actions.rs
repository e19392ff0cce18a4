//! Action Coordinator
//!
//! Reacts to scheduler events: opens the per-process alert handle on
//! detection, suspends or terminates on budget expiry and resumes once the
//! scheduled delay has passed. Outcomes go back out on the event bus.

use crate::clock::{add, Clock};
use crate::config::{ActionType, AlertUntil, ConfigSource};
use crate::controller::ProcessControl;
use crate::events::{ControlAction, DetectionAction, EventBus, WatchEvent};
use crate::media::MediaDeviceUsage;
use crate::notification::{AlertFactory, AlertSink};
use crate::registry::{MonitoredProcess, ProcessRegistry, ProcessStatus};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct CoordinatorState {
    alerts: HashMap<u32, Box<dyn AlertSink>>,
    /// PID -> resume deadline
    resumes: BTreeMap<u32, DateTime<Local>>,
    /// Every PID this coordinator froze, with its last known entry
    suspended: HashMap<u32, MonitoredProcess>,
}

pub struct ActionCoordinator {
    registry: Arc<ProcessRegistry>,
    controller: Arc<dyn ProcessControl>,
    alerts: Arc<dyn AlertFactory>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: Arc<dyn ConfigSource>,
    state: Mutex<CoordinatorState>,
}

impl ActionCoordinator {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        controller: Arc<dyn ProcessControl>,
        alerts: Arc<dyn AlertFactory>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            registry,
            controller,
            alerts,
            bus,
            clock,
            config,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    pub fn handle(&self, event: &WatchEvent) {
        match event {
            WatchEvent::ProcessDetected {
                process,
                action: DetectionAction::Detected,
                media,
            } => self.open_alert(process, media.as_ref()),
            WatchEvent::ProcessDetected {
                process,
                action: DetectionAction::Exited,
                ..
            } => {
                let pid = process.pid;
                // A media-gated process stops capturing once frozen; it keeps
                // its resume deadline while untracked
                if self.is_suspended(pid) && self.controller.is_running(pid) {
                    self.drop_alert(pid);
                    info!(
                        "{} (PID {}) left tracking while suspended",
                        process.name, pid
                    );
                } else {
                    self.teardown(pid);
                }
            }
            WatchEvent::ProcessExceededLimit { process, action } => {
                if !self.config.current().settings.enable_auto_action {
                    info!(
                        "{} (PID {}) over budget, automatic actions disabled",
                        process.name, process.pid
                    );
                    return;
                }
                match action {
                    ActionType::None => {}
                    ActionType::Suspend => self.suspend(process),
                    ActionType::Terminate => self.terminate(process),
                }
            }
            _ => {}
        }
    }

    /// Resumes every PID whose deadline has passed. Returns how many were due.
    pub fn run_due_resumes(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<u32> = {
            let mut state = self.state.lock();
            let due: Vec<u32> = state
                .resumes
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(pid, _)| *pid)
                .collect();
            for pid in &due {
                state.resumes.remove(pid);
            }
            due
        };

        for &pid in &due {
            if self.knows(pid) {
                self.resume(pid, false);
            } else {
                debug!("PID {} gone before its resume", pid);
            }
        }
        due.len()
    }

    /// Manual resume of a tracked or suspended PID, cancels any pending
    /// auto-resume
    pub fn resume_now(&self, pid: u32) -> bool {
        self.state.lock().resumes.remove(&pid);
        if !self.knows(pid) {
            return false;
        }
        self.resume(pid, true)
    }

    pub fn pending_resumes(&self) -> usize {
        self.state.lock().resumes.len()
    }

    pub fn is_suspended(&self, pid: u32) -> bool {
        self.state.lock().suspended.contains_key(&pid)
    }

    /// Drops every alert handle. Processes waiting for an auto-resume are
    /// resumed now instead of staying suspended.
    pub fn shutdown(&self) {
        let pending: Vec<u32> = {
            let mut state = self.state.lock();
            state.alerts.clear();
            std::mem::take(&mut state.resumes).into_keys().collect()
        };
        for pid in pending {
            if self.knows(pid) {
                self.resume(pid, false);
            }
        }
    }

    fn knows(&self, pid: u32) -> bool {
        self.registry.contains(pid) || self.is_suspended(pid)
    }

    fn open_alert(&self, process: &MonitoredProcess, media: Option<&MediaDeviceUsage>) {
        let config = self.config.current();
        let alert_config = config.alert_config_for(&process.config);
        let mut sink = self.alerts.create(alert_config);
        sink.show_start_alert(&process.name, &process.display_name, media);
        sink.show_continuous_alert();
        // A leftover handle for the same PID is dropped here
        self.state.lock().alerts.insert(process.pid, sink);
    }

    fn drop_alert(&self, pid: u32) {
        if let Some(mut sink) = self.state.lock().alerts.remove(&pid) {
            sink.hide_continuous_alert();
        }
    }

    /// Forgets everything held for a PID
    fn teardown(&self, pid: u32) {
        self.drop_alert(pid);
        let mut state = self.state.lock();
        state.resumes.remove(&pid);
        state.suspended.remove(&pid);
    }

    fn alert_until(&self, process: &MonitoredProcess) -> AlertUntil {
        let config = self.config.current();
        config.alert_config_for(&process.config).continuous_alert_until
    }

    fn suspend(&self, process: &MonitoredProcess) {
        let pid = process.pid;
        if !self.controller.suspend(pid) {
            warn!("Could not suspend {} (PID {})", process.name, pid);
            self.publish(WatchEvent::ActionFailed {
                process: process.clone(),
                operation: ControlAction::Suspend,
            });
            return;
        }

        self.registry.set_status(pid, ProcessStatus::Suspended);
        let snapshot = self.registry.get(pid).unwrap_or_else(|| MonitoredProcess {
            status: ProcessStatus::Suspended,
            ..process.clone()
        });
        let delay = process.config.auto_resume_after;
        let resume_at = (!delay.is_zero()).then(|| add(self.clock.now(), delay));
        {
            let mut state = self.state.lock();
            if let Some(at) = resume_at {
                state.resumes.insert(pid, at);
            }
            state.suspended.insert(pid, snapshot.clone());
            if self.alert_until(process) == AlertUntil::ProcessSuspend {
                if let Some(sink) = state.alerts.get_mut(&pid) {
                    sink.hide_continuous_alert();
                }
            }
        }

        info!("Suspended {} (PID {})", process.name, pid);
        self.publish(WatchEvent::ProcessSuspended {
            process: snapshot,
            resume_at,
        });
    }

    fn terminate(&self, process: &MonitoredProcess) {
        let pid = process.pid;
        if !self.controller.terminate(pid) {
            warn!("Could not terminate {} (PID {})", process.name, pid);
            self.publish(WatchEvent::ActionFailed {
                process: process.clone(),
                operation: ControlAction::Terminate,
            });
            return;
        }

        let reaped = self.registry.reap(pid).unwrap_or_else(|| MonitoredProcess {
            status: ProcessStatus::Exited,
            ..process.clone()
        });
        self.teardown(pid);
        info!("Terminated {} (PID {})", process.name, pid);
        self.publish(WatchEvent::ProcessTerminated { process: reaped });
    }

    fn resume(&self, pid: u32, manual: bool) -> bool {
        let known = self
            .registry
            .get(pid)
            .or_else(|| self.state.lock().suspended.get(&pid).cloned());
        let Some(process) = known else {
            return false;
        };
        if !self.controller.resume(pid) {
            warn!("Could not resume {} (PID {})", process.name, pid);
            self.publish(WatchEvent::ActionFailed {
                process,
                operation: ControlAction::Resume,
            });
            return false;
        }

        self.registry.set_status(pid, ProcessStatus::Running);
        {
            let mut state = self.state.lock();
            state.suspended.remove(&pid);
            if self.alert_until(&process) == AlertUntil::ProcessSuspend {
                if let Some(sink) = state.alerts.get_mut(&pid) {
                    sink.show_continuous_alert();
                }
            }
        }

        info!("Resumed {} (PID {})", process.name, pid);
        let snapshot = self.registry.get(pid).unwrap_or(MonitoredProcess {
            status: ProcessStatus::Running,
            ..process
        });
        self.publish(WatchEvent::ProcessResumed {
            process: snapshot,
            manual,
        });
        true
    }

    fn publish(&self, event: WatchEvent) {
        self.bus.publish(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, ProcessConfig, WatchConfig};
    use crate::testing::{ManualClock, RecordingAlerts, RecordingController};
    use std::time::Duration;

    struct Fixture {
        registry: Arc<ProcessRegistry>,
        controller: Arc<RecordingController>,
        alerts: Arc<RecordingAlerts>,
        clock: Arc<ManualClock>,
        events: crossbeam_channel::Receiver<WatchEvent>,
        coordinator: ActionCoordinator,
    }

    fn fixture(config: WatchConfig) -> Fixture {
        let registry = Arc::new(ProcessRegistry::new());
        let controller = Arc::new(RecordingController::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let clock = Arc::new(ManualClock::new());
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let coordinator = ActionCoordinator::new(
            registry.clone(),
            controller.clone(),
            alerts.clone(),
            bus,
            clock.clone(),
            Arc::new(ConfigStore::in_memory(config)),
        );
        Fixture {
            registry,
            controller,
            alerts,
            clock,
            events,
            coordinator,
        }
    }

    fn config_with(process: ProcessConfig) -> WatchConfig {
        WatchConfig::empty().with_process(process)
    }

    fn track(f: &Fixture, pid: u32, config: &WatchConfig) -> MonitoredProcess {
        let process_config = config.process_configs.values().next().unwrap().clone();
        let now = f.clock.now();
        let name = process_config.process_name.clone();
        let detected = f
            .registry
            .insert_new(MonitoredProcess::new(pid, &name, process_config, now, now))
            .unwrap();
        f.coordinator.handle(&WatchEvent::ProcessDetected {
            process: detected.clone(),
            action: DetectionAction::Detected,
            media: None,
        });
        detected
    }

    fn exceed(f: &Fixture, process: &MonitoredProcess) {
        f.coordinator.handle(&WatchEvent::ProcessExceededLimit {
            process: process.clone(),
            action: process.config.action_type,
        });
    }

    fn kinds(f: &Fixture) -> Vec<&'static str> {
        f.events.try_iter().map(|e| e.kind()).collect()
    }

    #[test]
    fn suspend_then_auto_resume() {
        let config = config_with(ProcessConfig {
            auto_resume_after: Duration::from_secs(5),
            ..ProcessConfig::new("cap.exe")
        });
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);

        exceed(&f, &process);
        assert_eq!(f.controller.calls(), vec!["suspend 7"]);
        assert_eq!(f.registry.get(7).unwrap().status, ProcessStatus::Suspended);
        assert_eq!(f.coordinator.pending_resumes(), 1);

        f.clock.advance(Duration::from_secs(4));
        assert_eq!(f.coordinator.run_due_resumes(), 0);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.coordinator.run_due_resumes(), 1);

        assert_eq!(f.controller.calls(), vec!["suspend 7", "resume 7"]);
        assert_eq!(f.registry.get(7).unwrap().status, ProcessStatus::Running);
        assert_eq!(kinds(&f), vec!["Suspended", "Resumed"]);
    }

    #[test]
    fn zero_resume_delay_means_manual_only() {
        let config = config_with(ProcessConfig {
            auto_resume_after: Duration::ZERO,
            ..ProcessConfig::new("cap.exe")
        });
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);

        exceed(&f, &process);
        f.clock.advance(Duration::from_secs(3600));
        assert_eq!(f.coordinator.run_due_resumes(), 0);
        assert_eq!(f.registry.get(7).unwrap().status, ProcessStatus::Suspended);

        assert!(f.coordinator.resume_now(7));
        assert_eq!(f.registry.get(7).unwrap().status, ProcessStatus::Running);
        assert!(!f.coordinator.resume_now(99));
    }

    #[test]
    fn failed_suspend_is_reported_and_not_retried() {
        let config = config_with(ProcessConfig::new("cap.exe"));
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);
        f.controller.fail_on(7);

        exceed(&f, &process);
        assert_eq!(f.registry.get(7).unwrap().status, ProcessStatus::Running);
        assert_eq!(f.coordinator.pending_resumes(), 0);
        assert_eq!(kinds(&f), vec!["ActionFailed"]);
        assert_eq!(f.controller.calls().len(), 1);
    }

    #[test]
    fn terminate_tears_everything_down() {
        let config = config_with(ProcessConfig {
            action_type: ActionType::Terminate,
            ..ProcessConfig::new("remote.exe")
        });
        let f = fixture(config.clone());
        let process = track(&f, 8, &config);
        assert_eq!(f.alerts.open_handles(), 1);

        exceed(&f, &process);
        assert!(!f.registry.contains(8));
        assert_eq!(f.alerts.open_handles(), 0);
        assert_eq!(kinds(&f), vec!["Terminated"]);
    }

    #[test]
    fn auto_action_switch_disables_actions() {
        let mut config = config_with(ProcessConfig::new("cap.exe"));
        config.settings.enable_auto_action = false;
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);

        exceed(&f, &process);
        assert!(f.controller.calls().is_empty());
        assert!(kinds(&f).is_empty());
    }

    #[test]
    fn continuous_alert_follows_suspension_when_configured() {
        let mut config = config_with(ProcessConfig {
            auto_resume_after: Duration::from_secs(5),
            ..ProcessConfig::new("cap.exe")
        });
        config.alert_config.continuous_alert_until = AlertUntil::ProcessSuspend;
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);

        exceed(&f, &process);
        f.clock.advance(Duration::from_secs(5));
        f.coordinator.run_due_resumes();

        assert_eq!(
            f.alerts.calls(),
            vec!["start cap.exe", "show", "hide", "show"]
        );
    }

    #[test]
    fn exit_drops_alert_and_pending_resume() {
        let config = config_with(ProcessConfig::new("cap.exe"));
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);
        exceed(&f, &process);
        assert_eq!(f.coordinator.pending_resumes(), 1);

        f.controller.set_gone(7);
        let exited = f.registry.reap(7).unwrap();
        f.coordinator.handle(&WatchEvent::ProcessDetected {
            process: exited,
            action: DetectionAction::Exited,
            media: None,
        });
        assert_eq!(f.coordinator.pending_resumes(), 0);
        assert!(!f.coordinator.is_suspended(7));
        assert_eq!(f.alerts.open_handles(), 0);
        assert_eq!(f.controller.calls(), vec!["suspend 7"]);
    }

    fn drop_from_tracking(f: &Fixture, pid: u32) {
        let exited = f.registry.reap(pid).unwrap();
        f.coordinator.handle(&WatchEvent::ProcessDetected {
            process: exited,
            action: DetectionAction::Exited,
            media: None,
        });
    }

    #[test]
    fn untracked_suspended_process_keeps_its_resume_deadline() {
        let config = config_with(ProcessConfig {
            auto_resume_after: Duration::from_secs(5),
            ..ProcessConfig::new("cam.exe")
        });
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);
        exceed(&f, &process);

        drop_from_tracking(&f, 7);
        assert_eq!(f.controller.calls(), vec!["suspend 7"]);
        assert_eq!(f.alerts.open_handles(), 0);
        assert!(f.coordinator.is_suspended(7));

        f.clock.advance(Duration::from_secs(4));
        assert_eq!(f.coordinator.run_due_resumes(), 0);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.coordinator.run_due_resumes(), 1);
        assert_eq!(f.controller.calls(), vec!["suspend 7", "resume 7"]);
        assert!(!f.coordinator.is_suspended(7));
        assert!(!f.registry.contains(7));
    }

    #[test]
    fn untracked_manual_only_process_can_still_be_resumed() {
        let config = config_with(ProcessConfig {
            auto_resume_after: Duration::ZERO,
            ..ProcessConfig::new("cam.exe")
        });
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);
        exceed(&f, &process);

        drop_from_tracking(&f, 7);
        assert_eq!(f.controller.calls(), vec!["suspend 7"]);

        assert!(f.coordinator.resume_now(7));
        assert_eq!(f.controller.calls(), vec!["suspend 7", "resume 7"]);
        let resumed = f.events.try_iter().last().unwrap();
        assert!(matches!(
            resumed,
            WatchEvent::ProcessResumed { manual: true, ref process } if process.pid == 7
        ));
        assert!(!f.coordinator.resume_now(7));
    }

    #[test]
    fn huge_resume_delay_never_comes_due() {
        let config = config_with(ProcessConfig {
            auto_resume_after: Duration::from_secs(10_000_000_000_000),
            ..ProcessConfig::new("cap.exe")
        });
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);
        exceed(&f, &process);

        assert_eq!(f.coordinator.run_due_resumes(), 0);
        f.clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(f.coordinator.run_due_resumes(), 0);
        assert_eq!(f.controller.calls(), vec!["suspend 7"]);
        assert_eq!(f.coordinator.pending_resumes(), 1);
    }

    #[test]
    fn shutdown_resumes_waiting_processes() {
        let config = config_with(ProcessConfig::new("cap.exe"));
        let f = fixture(config.clone());
        let process = track(&f, 7, &config);
        exceed(&f, &process);

        f.coordinator.shutdown();
        assert_eq!(f.controller.calls(), vec!["suspend 7", "resume 7"]);
        assert_eq!(f.alerts.open_handles(), 0);
    }
}
