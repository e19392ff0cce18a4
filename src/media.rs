//! Media Usage Detection
//!
//! Answers "which PIDs hold the camera or microphone right now". The OS
//! consent records are the primary source; when they report nothing at all
//! a rate-limited sweep over loaded modules takes over. Results are cached
//! so the scheduler can ask every cycle.

use crate::clock::{elapsed, Clock};
use crate::config::{process_key, DetectorSettings};
use crate::sys::{
    capture_module_names, is_core_os_process, ActiveHolder, ConsentStore, DeviceClass,
    ModuleInspector, ProbeError, ProcessEntry, ProcessTable,
};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One process currently capturing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDeviceUsage {
    pub pid: u32,
    pub process_name: String,
    pub camera: bool,
    pub microphone: bool,
    pub detected_at: DateTime<Local>,
}

impl MediaDeviceUsage {
    /// Human readable device list, e.g. "camera + microphone"
    pub fn devices(&self) -> String {
        match (self.camera, self.microphone) {
            (true, true) => "camera + microphone".to_string(),
            (true, false) => "camera".to_string(),
            (false, true) => "microphone".to_string(),
            (false, false) => "none".to_string(),
        }
    }

    fn set(&mut self, device: DeviceClass) {
        match device {
            DeviceClass::Camera => self.camera = true,
            DeviceClass::Microphone => self.microphone = true,
        }
    }
}

#[derive(Default)]
struct DetectorState {
    cache: BTreeMap<u32, MediaDeviceUsage>,
    last_poll: Option<DateTime<Local>>,
    last_full_scan: Option<DateTime<Local>>,
    /// Failure conditions already reported
    reported: HashSet<String>,
}

impl DetectorState {
    fn cached(&self) -> Vec<MediaDeviceUsage> {
        self.cache.values().cloned().collect()
    }

    /// Logs a failure the first time it shows up
    fn report(&mut self, condition: String, error: &ProbeError) {
        if self.reported.insert(condition.clone()) {
            warn!("{} unavailable: {}", condition, error);
        }
    }

    fn clear(&mut self, condition: &str) {
        if self.reported.remove(condition) {
            info!("{} available again", condition);
        }
    }
}

pub struct MediaUsageDetector {
    table: Arc<dyn ProcessTable>,
    store: Arc<dyn ConsentStore>,
    modules: Arc<dyn ModuleInspector>,
    clock: Arc<dyn Clock>,
    settings: Mutex<DetectorSettings>,
    state: Mutex<DetectorState>,
}

impl MediaUsageDetector {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        store: Arc<dyn ConsentStore>,
        modules: Arc<dyn ModuleInspector>,
        clock: Arc<dyn Clock>,
        settings: DetectorSettings,
    ) -> Self {
        Self {
            table,
            store,
            modules,
            clock,
            settings: Mutex::new(settings),
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Applies new intervals from a reloaded config
    pub fn apply_settings(&self, settings: &DetectorSettings) {
        let mut current = self.settings.lock();
        if *current != *settings {
            debug!("Detector settings updated: {:?}", settings);
            *current = settings.clone();
        }
    }

    /// Current capture users, one entry per PID. Never fails.
    pub fn active_device_users(&self) -> Vec<MediaDeviceUsage> {
        let settings = self.settings.lock().clone();
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(last) = state.last_poll {
            if elapsed(last, now) < settings.poll_interval() {
                return state.cached();
            }
        }
        state.last_poll = Some(now);

        let mut processes: Option<Vec<ProcessEntry>> = None;
        let mut found = self.read_consent_store(&mut state, &mut processes, now);

        if found.is_empty() {
            let sweep_due = state
                .last_full_scan
                .map(|last| elapsed(last, now) >= settings.full_scan_interval())
                .unwrap_or(true);
            if !sweep_due {
                // Keep the last answer until the sweep may run again
                return state.cached();
            }
            state.last_full_scan = Some(now);
            let processes = processes.get_or_insert_with(|| self.table.snapshot());
            found = self.sweep_modules(&mut state, processes, settings.max_modules_checked, now);
        }

        state.cache = found;
        state.cached()
    }

    /// Last snapshot without touching the OS
    pub fn cached(&self) -> Vec<MediaDeviceUsage> {
        self.state.lock().cached()
    }

    /// Drops a reaped PID from the cache
    pub fn forget(&self, pid: u32) {
        self.state.lock().cache.remove(&pid);
    }

    fn read_consent_store(
        &self,
        state: &mut DetectorState,
        processes: &mut Option<Vec<ProcessEntry>>,
        now: DateTime<Local>,
    ) -> BTreeMap<u32, MediaDeviceUsage> {
        let mut found = BTreeMap::new();

        for device in DeviceClass::ALL {
            let condition = format!("{} consent store", device.store_key());
            let holders = match self.store.active_holders(device) {
                Ok(holders) => {
                    state.clear(&condition);
                    holders
                }
                Err(e) => {
                    state.report(condition, &e);
                    continue;
                }
            };
            if holders.is_empty() {
                continue;
            }

            let processes = processes.get_or_insert_with(|| self.table.snapshot());
            for holder in holders {
                match holder {
                    ActiveHolder::Executable(path) => {
                        let key = process_key(&path.to_string_lossy());
                        for process in processes.iter().filter(|p| process_key(&p.name) == key) {
                            mark(&mut found, process, device, now);
                        }
                    }
                    ActiveHolder::Process(pid) => {
                        if let Some(process) = processes.iter().find(|p| p.pid == pid) {
                            mark(&mut found, process, device, now);
                        }
                    }
                }
            }
        }

        found
    }

    fn sweep_modules(
        &self,
        state: &mut DetectorState,
        processes: &[ProcessEntry],
        max_modules_checked: usize,
        now: DateTime<Local>,
    ) -> BTreeMap<u32, MediaDeviceUsage> {
        let (camera_libs, microphone_libs) = capture_module_names();
        let mut found = BTreeMap::new();
        let mut inspected = 0usize;
        let mut denied = 0usize;

        for process in processes
            .iter()
            .filter(|p| !is_core_os_process(p.pid, &p.name))
        {
            let modules = match self.modules.loaded_modules(process.pid) {
                Ok(modules) => modules,
                Err(ProbeError::AccessDenied(_)) => {
                    denied += 1;
                    continue;
                }
                Err(_) => continue,
            };
            inspected += 1;

            let (camera, microphone) =
                match_capture_modules(&modules, camera_libs, microphone_libs, max_modules_checked);
            if camera {
                mark(&mut found, process, DeviceClass::Camera, now);
            }
            if microphone {
                mark(&mut found, process, DeviceClass::Microphone, now);
            }
        }

        let condition = "module inspection".to_string();
        if inspected == 0 && denied > 0 {
            state.report(
                condition,
                &ProbeError::AccessDenied(format!("{} processes", denied)),
            );
        } else {
            state.clear(&condition);
        }
        debug!(
            "Module sweep: {} inspected, {} denied, {} capturing",
            inspected,
            denied,
            found.len()
        );
        found
    }
}

fn mark(
    found: &mut BTreeMap<u32, MediaDeviceUsage>,
    process: &ProcessEntry,
    device: DeviceClass,
    now: DateTime<Local>,
) {
    found
        .entry(process.pid)
        .or_insert_with(|| MediaDeviceUsage {
            pid: process.pid,
            process_name: process.name.clone(),
            camera: false,
            microphone: false,
            detected_at: now,
        })
        .set(device);
}

/// Scans module names for capture libraries. Once `cap` modules have been
/// looked at the scan stops as soon as anything matched.
fn match_capture_modules(
    modules: &[String],
    camera_libs: &[&str],
    microphone_libs: &[&str],
    cap: usize,
) -> (bool, bool) {
    let mut camera = false;
    let mut microphone = false;

    for (index, module) in modules.iter().enumerate() {
        if index >= cap && (camera || microphone) {
            break;
        }
        let name = module.to_lowercase();
        if !camera && camera_libs.iter().any(|lib| name.contains(lib)) {
            camera = true;
        }
        if !microphone && microphone_libs.iter().any(|lib| name.contains(lib)) {
            microphone = true;
        }
        if camera && microphone {
            break;
        }
    }

    (camera, microphone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConsentStore, FakeModules, FakeProcessTable, ManualClock};
    use std::time::Duration;

    struct Fixture {
        table: Arc<FakeProcessTable>,
        store: Arc<FakeConsentStore>,
        modules: Arc<FakeModules>,
        clock: Arc<ManualClock>,
        detector: MediaUsageDetector,
    }

    fn fixture() -> Fixture {
        let table = Arc::new(FakeProcessTable::default());
        let store = Arc::new(FakeConsentStore::default());
        let modules = Arc::new(FakeModules::default());
        let clock = Arc::new(ManualClock::new());
        let detector = MediaUsageDetector::new(
            table.clone(),
            store.clone(),
            modules.clone(),
            clock.clone(),
            DetectorSettings::default(),
        );
        Fixture {
            table,
            store,
            modules,
            clock,
            detector,
        }
    }

    #[test]
    fn consent_paths_resolve_to_every_matching_pid() {
        let f = fixture();
        f.table.spawn(10, "Zoom.exe");
        f.table.spawn(11, "zoom.exe");
        f.table.spawn(12, "notepad.exe");
        f.store
            .set_executables(DeviceClass::Camera, &[r"C:\Program Files\Zoom\bin\Zoom.exe"]);
        f.store
            .set_executables(DeviceClass::Microphone, &[r"C:\Program Files\Zoom\bin\Zoom.exe"]);

        let users = f.detector.active_device_users();
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|u| u.camera && u.microphone));
        assert_eq!(users[0].devices(), "camera + microphone");
    }

    #[test]
    fn flags_are_merged_per_pid() {
        let f = fixture();
        f.table.spawn(20, "cam.exe");
        f.store.set_pids(DeviceClass::Camera, &[20]);
        f.store.set_pids(DeviceClass::Microphone, &[20]);

        let users = f.detector.active_device_users();
        assert_eq!(users.len(), 1);
        assert!(users[0].camera && users[0].microphone);
    }

    #[test]
    fn reads_within_poll_interval_are_served_from_cache() {
        let f = fixture();
        f.table.spawn(20, "cam.exe");
        f.store.set_pids(DeviceClass::Camera, &[20]);

        let first = f.detector.active_device_users();
        f.clock.advance(Duration::from_millis(200));
        let second = f.detector.active_device_users();
        assert_eq!(first, second);
        assert_eq!(f.store.reads(), 2);

        f.clock.advance(Duration::from_millis(400));
        f.detector.active_device_users();
        assert_eq!(f.store.reads(), 4);
    }

    #[test]
    fn empty_primary_keeps_cache_during_sweep_cool_down() {
        let f = fixture();
        f.table.spawn(20, "cam.exe");
        f.store.set_pids(DeviceClass::Camera, &[20]);
        assert_eq!(f.detector.active_device_users().len(), 1);

        // Transient gap: consent store momentarily empty
        f.store.set_pids(DeviceClass::Camera, &[]);
        f.clock.advance(Duration::from_secs(1));
        // The sweep runs once (never ran before) and finds nothing
        assert!(f.detector.active_device_users().is_empty());

        f.store.set_pids(DeviceClass::Camera, &[20]);
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.detector.active_device_users().len(), 1);

        f.store.set_pids(DeviceClass::Camera, &[]);
        f.clock.advance(Duration::from_secs(1));
        // Sweep still cooling down: previous snapshot is returned
        assert_eq!(f.detector.active_device_users().len(), 1);
    }

    #[test]
    fn access_denied_falls_back_to_module_sweep() {
        let f = fixture();
        f.table.spawn(4, "System");
        f.table.spawn(30, "recorder.exe");
        f.table.spawn(31, "editor.exe");
        f.store.deny_all();
        let (camera_libs, microphone_libs) = capture_module_names();
        let camera_module = format!("{}.dll", camera_libs[0]).to_uppercase();
        let microphone_module = format!("{}.dll", microphone_libs[0]);
        f.modules.set(4, &[&camera_module]);
        f.modules.set(30, &["ntdll.dll", &camera_module, &microphone_module]);
        f.modules.set(31, &["ntdll.dll", "user32.dll"]);

        let users = f.detector.active_device_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].pid, 30);
        assert!(users[0].camera && users[0].microphone);
    }

    #[test]
    fn forget_drops_cached_pid() {
        let f = fixture();
        f.table.spawn(20, "cam.exe");
        f.store.set_pids(DeviceClass::Camera, &[20]);
        f.detector.active_device_users();

        f.detector.forget(20);
        assert!(f.detector.cached().is_empty());
    }

    #[test]
    fn failures_are_reported_once_per_condition() {
        let f = fixture();
        f.store.deny_all();
        f.detector.active_device_users();
        f.clock.advance(Duration::from_secs(6));
        f.detector.active_device_users();

        let state = f.detector.state.lock();
        assert!(state.reported.contains("webcam consent store"));
        assert_eq!(state.reported.len(), 2);
    }

    #[test]
    fn module_scan_stops_after_cap_once_matched() {
        let mut modules: Vec<String> = vec!["audioses.dll".to_string()];
        modules.extend((0..10).map(|i| format!("filler{}.dll", i)));
        modules.push("mfplat.dll".to_string());

        assert_eq!(
            match_capture_modules(&modules, &["mfplat"], &["audioses"], 5),
            (false, true)
        );
        assert_eq!(
            match_capture_modules(&modules, &["mfplat"], &["audioses"], 50),
            (true, true)
        );
        // Without an early match the cap does not apply
        assert_eq!(
            match_capture_modules(&modules[1..], &["mfplat"], &["audioses"], 5),
            (true, false)
        );
    }
}
