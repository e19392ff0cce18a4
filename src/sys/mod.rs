//! OS Access Layer
//!
//! The engine never talks to the operating system directly. Process
//! enumeration, device-usage records and loaded-module lists come in through
//! the traits below; `win32.rs` and `unix.rs` provide the native versions.

use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[cfg(windows)]
mod win32;
#[cfg(windows)]
pub use self::win32::{
    resume_process, suspend_process, terminate_process, ConsentRegistry, ToolhelpModules,
    ToolhelpProcessTable,
};

#[cfg(not(windows))]
mod unix;
#[cfg(not(windows))]
pub use self::unix::{
    resume_process, suspend_process, terminate_process, DeviceNodeScan, MapsModules,
    SysinfoProcessTable,
};

/// One row of the process table
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Executable file name as reported by the OS (e.g. `Zoom.exe`)
    pub name: String,
    /// OS process start time, if the OS reports one
    pub start_time: Option<DateTime<Local>>,
}

/// Capture device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Camera,
    Microphone,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 2] = [DeviceClass::Camera, DeviceClass::Microphone];

    /// Consent store key name
    pub fn store_key(&self) -> &'static str {
        match self {
            DeviceClass::Camera => "webcam",
            DeviceClass::Microphone => "microphone",
        }
    }
}

/// Something the OS reports as currently capturing
#[derive(Debug, Clone, PartialEq)]
pub enum ActiveHolder {
    /// Executable path from a consent record; resolved to PIDs by name
    Executable(PathBuf),
    /// A process known to hold the device
    Process(u32),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProbeError {
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not supported on this platform")]
    Unsupported,
    #[error("os error: {0}")]
    Os(String),
}

/// Failure of a suspend/resume/terminate request
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("access to process {0} denied")]
    AccessDenied(u32),
    #[error("process {pid} still running after {waited_ms} ms")]
    Timeout { pid: u32, waited_ms: u64 },
    #[error("os error: {0}")]
    Os(String),
}

/// Running processes
pub trait ProcessTable: Send + Sync {
    /// All processes currently visible
    fn snapshot(&self) -> Vec<ProcessEntry>;
    /// Whether `pid` resolves to a live process
    fn is_running(&self, pid: u32) -> bool;
    /// OS start time, for tables whose snapshot leaves it out
    fn start_time(&self, _pid: u32) -> Option<DateTime<Local>> {
        None
    }
}

/// OS record of which applications are capturing right now
pub trait ConsentStore: Send + Sync {
    fn active_holders(&self, device: DeviceClass) -> Result<Vec<ActiveHolder>, ProbeError>;
}

/// Loaded libraries of a process
pub trait ModuleInspector: Send + Sync {
    fn loaded_modules(&self, pid: u32) -> Result<Vec<String>, ProbeError>;
}

/// Native process table
pub fn native_process_table() -> Arc<dyn ProcessTable> {
    #[cfg(windows)]
    {
        Arc::new(ToolhelpProcessTable)
    }
    #[cfg(not(windows))]
    {
        Arc::new(SysinfoProcessTable::new())
    }
}

/// Native device-usage records
pub fn native_consent_store() -> Arc<dyn ConsentStore> {
    #[cfg(windows)]
    {
        Arc::new(ConsentRegistry)
    }
    #[cfg(not(windows))]
    {
        Arc::new(DeviceNodeScan::default())
    }
}

/// Native module inspection
pub fn native_module_inspector() -> Arc<dyn ModuleInspector> {
    #[cfg(windows)]
    {
        Arc::new(ToolhelpModules)
    }
    #[cfg(not(windows))]
    {
        Arc::new(MapsModules)
    }
}

/// Executable path from a consent store subkey name.
/// Desktop apps are keyed by their path with `#` in place of `\`.
pub fn decode_consent_key(name: &str) -> PathBuf {
    let name = name.strip_prefix("NonPackaged#").unwrap_or(name);
    PathBuf::from(name.replace('#', "\\"))
}

/// Core OS processes the module sweep never touches
pub fn is_core_os_process(pid: u32, name: &str) -> bool {
    let lower = name.to_lowercase();
    pid == 0
        || pid == 4
        || lower.starts_with("system")
        || lower.starts_with("svchost")
        || lower.starts_with("registry")
}

/// Capture-library allow-list: (camera, microphone)
pub fn capture_module_names() -> (&'static [&'static str], &'static [&'static str]) {
    #[cfg(windows)]
    {
        (
            &["mfreadwrite", "mfplat", "ksproxy"],
            &["audioses", "audioeng"],
        )
    }
    #[cfg(not(windows))]
    {
        (
            &["libv4l", "libopencv_videoio"],
            &["libasound", "libpulse", "libpipewire"],
        )
    }
}
