//! Process access for Linux and other non-Windows systems
//!
//! Process table and signals come from sysinfo. Device usage is read from
//! `/proc/<pid>/fd` (who holds a video or ALSA capture node), loaded
//! libraries from `/proc/<pid>/maps`.

use super::{
    ActiveHolder, ConsentStore, ControlError, DeviceClass, ModuleInspector, ProbeError,
    ProcessEntry, ProcessTable,
};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::debug;

/// Poll step while waiting for a terminated process
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process table backed by a long-lived sysinfo `System`
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn snapshot(&self) -> Vec<ProcessEntry> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);

        system
            .processes()
            .iter()
            // Threads show up as tasks on Linux, only keep real processes
            .filter(|(_, process)| process.thread_kind().is_none())
            .filter(|(_, process)| !is_gone(process.status()))
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().to_string(),
                start_time: start_time(process.start_time()),
            })
            .collect()
    }

    fn is_running(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|p| !is_gone(p.status()))
            .unwrap_or(false)
    }
}

fn is_gone(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn start_time(epoch_secs: u64) -> Option<DateTime<Local>> {
    if epoch_secs == 0 {
        return None;
    }
    DateTime::from_timestamp(epoch_secs as i64, 0).map(|t| t.with_timezone(&Local))
}

/// Stops every thread of the process (SIGSTOP)
pub fn suspend_process(pid: u32) -> Result<(), ControlError> {
    send_signal(pid, Signal::Stop)
}

/// Continues a stopped process (SIGCONT)
pub fn resume_process(pid: u32) -> Result<(), ControlError> {
    send_signal(pid, Signal::Continue)
}

/// Sends SIGTERM and waits up to `timeout` for the process to go away
pub fn terminate_process(pid: u32, timeout: Duration) -> Result<(), ControlError> {
    send_signal(pid, Signal::Term)?;

    let target = Pid::from_u32(pid);
    let mut system = System::new();
    let started = Instant::now();
    loop {
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        let alive = system
            .process(target)
            .map(|p| !is_gone(p.status()))
            .unwrap_or(false);
        if !alive {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(ControlError::Timeout {
                pid,
                waited_ms: timeout.as_millis() as u64,
            });
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), ControlError> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

    let process = system.process(target).ok_or(ControlError::NotFound(pid))?;
    match process.kill_with(signal) {
        Some(true) => Ok(()),
        // kill(2) refused, almost always EPERM
        Some(false) => Err(ControlError::AccessDenied(pid)),
        None => Err(ControlError::Os(format!("{:?} not supported", signal))),
    }
}

/// Finds holders of video and ALSA capture nodes by walking `/proc/*/fd`
#[derive(Debug, Clone)]
pub struct DeviceNodeScan {
    proc_root: PathBuf,
}

impl Default for DeviceNodeScan {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl ConsentStore for DeviceNodeScan {
    fn active_holders(&self, device: DeviceClass) -> Result<Vec<ActiveHolder>, ProbeError> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ProbeError::Unsupported,
            _ => ProbeError::Os(e.to_string()),
        })?;

        let mut holders = BTreeSet::new();
        let mut readable = 0usize;
        let mut denied = 0usize;

        for entry in entries.filter_map(|e| e.ok()) {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let fd_dir = entry.path().join("fd");
            let fds = match fs::read_dir(&fd_dir) {
                Ok(fds) => fds,
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    denied += 1;
                    continue;
                }
                Err(_) => continue,
            };
            readable += 1;

            let holds = fds
                .filter_map(|fd| fd.ok())
                .filter_map(|fd| fs::read_link(fd.path()).ok())
                .any(|target| is_capture_node(&target, device));
            if holds {
                holders.insert(pid);
            }
        }

        if readable == 0 && denied > 0 {
            return Err(ProbeError::AccessDenied(format!(
                "{}/*/fd",
                self.proc_root.display()
            )));
        }
        debug!("{:?} holders: {:?}", device, holders);
        Ok(holders.into_iter().map(ActiveHolder::Process).collect())
    }
}

/// `/dev/video*` for cameras, `/dev/snd/pcmC<card>D<dev>c` for capture streams
fn is_capture_node(target: &Path, device: DeviceClass) -> bool {
    let Some(path) = target.to_str() else {
        return false;
    };
    match device {
        DeviceClass::Camera => path.starts_with("/dev/video"),
        DeviceClass::Microphone => path
            .strip_prefix("/dev/snd/pcmC")
            .map(|rest| rest.ends_with('c') && rest.contains('D'))
            .unwrap_or(false),
    }
}

/// Loaded shared objects from `/proc/<pid>/maps`
#[derive(Debug, Clone, Copy, Default)]
pub struct MapsModules;

impl ModuleInspector for MapsModules {
    fn loaded_modules(&self, pid: u32) -> Result<Vec<String>, ProbeError> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => ProbeError::AccessDenied(format!("pid {}", pid)),
            ErrorKind::NotFound => ProbeError::NotFound(format!("pid {}", pid)),
            _ => ProbeError::Os(e.to_string()),
        })?;
        Ok(module_names(&maps))
    }
}

/// File names of mapped files, first occurrence order
fn module_names(maps: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut names = Vec::new();
    for line in maps.lines() {
        // address perms offset dev inode pathname
        let Some(path) = line.split_whitespace().nth(5) else {
            continue;
        };
        if !path.starts_with('/') {
            continue;
        }
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}
