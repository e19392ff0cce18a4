//! In-memory stand-ins for the OS seams, shared by the unit tests.

use crate::clock::{add, Clock};
use crate::config::AlertConfig;
use crate::controller::ProcessControl;
use crate::media::MediaDeviceUsage;
use crate::notification::{AlertFactory, AlertSink};
use crate::sys::{
    ActiveHolder, ConsentStore, DeviceClass, ModuleInspector, ProbeError, ProcessEntry,
    ProcessTable,
};
use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Local
            .with_ymd_and_hms(2024, 3, 4, 9, 0, 0)
            .single()
            .unwrap_or_else(Local::now);
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add(*now, by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock()
    }
}

#[derive(Default)]
pub struct FakeProcessTable {
    processes: Mutex<BTreeMap<u32, ProcessEntry>>,
}

impl FakeProcessTable {
    pub fn spawn(&self, pid: u32, name: &str) {
        self.processes.lock().insert(
            pid,
            ProcessEntry {
                pid,
                name: name.to_string(),
                start_time: None,
            },
        );
    }

    pub fn kill(&self, pid: u32) {
        self.processes.lock().remove(&pid);
    }
}

impl ProcessTable for FakeProcessTable {
    fn snapshot(&self) -> Vec<ProcessEntry> {
        self.processes.lock().values().cloned().collect()
    }

    fn is_running(&self, pid: u32) -> bool {
        self.processes.lock().contains_key(&pid)
    }
}

#[derive(Default)]
pub struct FakeConsentStore {
    holders: Mutex<HashMap<DeviceClass, Vec<ActiveHolder>>>,
    denied: AtomicBool,
    reads: AtomicUsize,
}

impl FakeConsentStore {
    pub fn set_executables(&self, device: DeviceClass, paths: &[&str]) {
        let holders = paths
            .iter()
            .map(|p| ActiveHolder::Executable(PathBuf::from(p)))
            .collect();
        self.holders.lock().insert(device, holders);
    }

    pub fn set_pids(&self, device: DeviceClass, pids: &[u32]) {
        let holders = pids.iter().map(|p| ActiveHolder::Process(*p)).collect();
        self.holders.lock().insert(device, holders);
    }

    pub fn deny_all(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    /// Number of `active_holders` calls so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ConsentStore for FakeConsentStore {
    fn active_holders(&self, device: DeviceClass) -> Result<Vec<ActiveHolder>, ProbeError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.denied.load(Ordering::SeqCst) {
            return Err(ProbeError::AccessDenied(device.store_key().to_string()));
        }
        Ok(self.holders.lock().get(&device).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeModules {
    modules: Mutex<HashMap<u32, Vec<String>>>,
}

impl FakeModules {
    pub fn set(&self, pid: u32, modules: &[&str]) {
        self.modules
            .lock()
            .insert(pid, modules.iter().map(|m| m.to_string()).collect());
    }
}

impl ModuleInspector for FakeModules {
    fn loaded_modules(&self, pid: u32) -> Result<Vec<String>, ProbeError> {
        Ok(self.modules.lock().get(&pid).cloned().unwrap_or_default())
    }
}

/// Records every control call; terminate removes the PID from the table
#[derive(Default)]
pub struct RecordingController {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<u32>>,
    gone: Mutex<HashSet<u32>>,
    table: Option<Arc<FakeProcessTable>>,
}

impl RecordingController {
    pub fn with_table(table: Arc<FakeProcessTable>) -> Self {
        Self {
            table: Some(table),
            ..Default::default()
        }
    }

    pub fn fail_on(&self, pid: u32) {
        self.failing.lock().insert(pid);
    }

    pub fn set_gone(&self, pid: u32) {
        self.gone.lock().insert(pid);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, operation: &str, pid: u32) -> bool {
        self.calls.lock().push(format!("{} {}", operation, pid));
        !self.failing.lock().contains(&pid)
    }
}

impl ProcessControl for RecordingController {
    fn suspend(&self, pid: u32) -> bool {
        self.record("suspend", pid)
    }

    fn resume(&self, pid: u32) -> bool {
        self.record("resume", pid)
    }

    fn terminate(&self, pid: u32) -> bool {
        let ok = self.record("terminate", pid);
        if ok {
            self.set_gone(pid);
            if let Some(table) = &self.table {
                table.kill(pid);
            }
        }
        ok
    }

    fn is_running(&self, pid: u32) -> bool {
        match &self.table {
            Some(table) => table.is_running(pid),
            None => !self.gone.lock().contains(&pid),
        }
    }
}

/// Alert factory recording what its handles were asked to do
#[derive(Default)]
pub struct RecordingAlerts {
    calls: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicUsize>,
}

impl RecordingAlerts {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Handles created and not yet dropped
    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl AlertFactory for RecordingAlerts {
    fn create(&self, _config: &AlertConfig) -> Box<dyn AlertSink> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Box::new(RecordingSink {
            calls: self.calls.clone(),
            open: self.open.clone(),
        })
    }
}

struct RecordingSink {
    calls: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicUsize>,
}

impl AlertSink for RecordingSink {
    fn show_start_alert(
        &mut self,
        process_name: &str,
        _display_name: &str,
        _media: Option<&MediaDeviceUsage>,
    ) {
        self.calls.lock().push(format!("start {}", process_name));
    }

    fn show_continuous_alert(&mut self) {
        self.calls.lock().push("show".to_string());
    }

    fn hide_continuous_alert(&mut self) {
        self.calls.lock().push("hide".to_string());
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
