//! Process Registry
//!
//! In-memory table of tracked processes keyed by PID, plus the one-shot
//! markers that make "near limit" and "exceeded" fire once per process
//! lifetime. Everything sits behind a single lock.

use crate::clock::elapsed;
use crate::config::{ActionType, ProcessConfig};
use crate::media::MediaDeviceUsage;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Lifecycle state of a tracked process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Detected,
    Running,
    Warned,
    Exceeded,
    Suspended,
    Exited,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Detected => "Detected",
            ProcessStatus::Running => "Running",
            ProcessStatus::Warned => "Warned",
            ProcessStatus::Exceeded => "Exceeded",
            ProcessStatus::Suspended => "Suspended",
            ProcessStatus::Exited => "Exited",
        }
    }
}

/// One tracked OS process
#[derive(Debug, Clone)]
pub struct MonitoredProcess {
    pub pid: u32,
    pub name: String,
    pub display_name: String,
    /// Start of tracking (capture start for media-gated processes)
    pub start_time: DateTime<Local>,
    pub runtime: Duration,
    pub status: ProcessStatus,
    pub media_gated: bool,
    pub media_usage: Option<MediaDeviceUsage>,
    pub config: Arc<ProcessConfig>,
}

impl MonitoredProcess {
    pub fn new(
        pid: u32,
        name: &str,
        config: Arc<ProcessConfig>,
        start_time: DateTime<Local>,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            pid,
            name: name.to_string(),
            display_name: config.label().to_string(),
            start_time,
            runtime: elapsed(start_time, now),
            status: ProcessStatus::Detected,
            media_gated: false,
            media_usage: None,
            config,
        }
    }

    pub fn with_media(mut self, usage: Option<MediaDeviceUsage>) -> Self {
        self.media_gated = true;
        self.media_usage = usage;
        self
    }

    /// Time left until the budget runs out, `None` without a budget
    pub fn remaining(&self) -> Option<Duration> {
        if self.config.max_runtime.is_zero() {
            return None;
        }
        Some(self.config.max_runtime.saturating_sub(self.runtime))
    }
}

/// One-shot transition found by `refresh`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    NearLimit { remaining: Duration },
    Exceeded,
}

/// Decides the next one-shot transition for a runtime
pub fn evaluate(
    runtime: Duration,
    max_runtime: Duration,
    lead: Duration,
    warned: bool,
    exceeded: bool,
) -> Option<Transition> {
    if max_runtime.is_zero() || exceeded {
        return None;
    }
    if runtime >= max_runtime {
        return Some(Transition::Exceeded);
    }
    let remaining = max_runtime - runtime;
    if !warned && remaining <= lead {
        return Some(Transition::NearLimit { remaining });
    }
    None
}

#[derive(Default)]
struct RegistryState {
    processes: BTreeMap<u32, MonitoredProcess>,
    warned: HashSet<u32>,
    exceeded: HashSet<u32>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.state.lock().processes.contains_key(&pid)
    }

    /// Registers a newly found process. It moves to `Running` right away;
    /// the returned copy still shows `Detected` for the event.
    /// `None` if the PID is already tracked.
    pub fn insert_new(&self, process: MonitoredProcess) -> Option<MonitoredProcess> {
        let mut state = self.state.lock();
        if state.processes.contains_key(&process.pid) {
            return None;
        }
        let detected = MonitoredProcess {
            status: ProcessStatus::Detected,
            ..process.clone()
        };
        state.processes.insert(
            process.pid,
            MonitoredProcess {
                status: ProcessStatus::Running,
                ..process
            },
        );
        Some(detected)
    }

    /// Recomputes the runtime and evaluates the one-shot transitions.
    /// Returns the updated entry and whatever fired, `None` for unknown PIDs.
    pub fn refresh(
        &self,
        pid: u32,
        now: DateTime<Local>,
        config: Arc<ProcessConfig>,
        usage: Option<MediaDeviceUsage>,
    ) -> Option<(MonitoredProcess, Vec<Transition>)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let process = state.processes.get_mut(&pid)?;

        process.runtime = elapsed(process.start_time, now);
        process.display_name = config.label().to_string();
        process.config = config;
        if process.media_gated {
            process.media_usage = usage;
        }

        let mut transitions = Vec::new();
        let fired = evaluate(
            process.runtime,
            process.config.max_runtime,
            process.config.alert_lead(),
            state.warned.contains(&pid),
            state.exceeded.contains(&pid),
        );
        match fired {
            Some(Transition::Exceeded) => {
                state.exceeded.insert(pid);
                // The warning window is gone for good
                state.warned.insert(pid);
                if process.config.action_type != ActionType::None
                    && matches!(process.status, ProcessStatus::Running | ProcessStatus::Warned)
                {
                    process.status = ProcessStatus::Exceeded;
                }
                transitions.push(Transition::Exceeded);
            }
            Some(transition @ Transition::NearLimit { .. }) => {
                state.warned.insert(pid);
                if process.status == ProcessStatus::Running {
                    process.status = ProcessStatus::Warned;
                }
                transitions.push(transition);
            }
            None => {}
        }

        Some((process.clone(), transitions))
    }

    pub fn set_status(&self, pid: u32, status: ProcessStatus) -> bool {
        match self.state.lock().processes.get_mut(&pid) {
            Some(process) => {
                process.status = status;
                true
            }
            None => false,
        }
    }

    /// Removes a PID together with its markers. Returns the final entry
    /// marked `Exited`.
    pub fn reap(&self, pid: u32) -> Option<MonitoredProcess> {
        let mut state = self.state.lock();
        state.warned.remove(&pid);
        state.exceeded.remove(&pid);
        let mut process = state.processes.remove(&pid)?;
        process.status = ProcessStatus::Exited;
        debug!("Reaped {} (PID {})", process.name, pid);
        Some(process)
    }

    pub fn get(&self, pid: u32) -> Option<MonitoredProcess> {
        self.state.lock().processes.get(&pid).cloned()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.state.lock().processes.keys().copied().collect()
    }

    /// Read-only copy of every tracked process
    pub fn snapshot(&self) -> BTreeMap<u32, MonitoredProcess> {
        self.state.lock().processes.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
