//! Process access for Windows
//!
//! Process, thread and module lists come from Toolhelp snapshots. Camera and
//! microphone usage is read from the CapabilityAccessManager consent store,
//! where a `LastUsedTimeStop` of 0 means "capturing right now".

use super::{
    decode_consent_key, ActiveHolder, ConsentStore, ControlError, DeviceClass, ModuleInspector,
    ProbeError, ProcessEntry, ProcessTable,
};
use chrono::{DateTime, Local};
use std::ffi::OsString;
use std::os::windows::ffi::OsStringExt;
use std::time::Duration;
use tracing::debug;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_INVALID_PARAMETER,
    ERROR_SUCCESS, FILETIME, HANDLE, STILL_ACTIVE, WAIT_OBJECT_0, WIN32_ERROR,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
    Thread32First, Thread32Next, MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE,
    TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Registry::{
    RegCloseKey, RegEnumKeyExW, RegOpenKeyExW, RegQueryValueExW, HKEY, HKEY_CURRENT_USER,
    HKEY_LOCAL_MACHINE, KEY_READ,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, GetProcessTimes, OpenProcess, OpenThread, ResumeThread, SuspendThread,
    TerminateProcess, WaitForSingleObject, PROCESS_ACCESS_RIGHTS, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_SYNCHRONIZE, PROCESS_TERMINATE, THREAD_SUSPEND_RESUME,
};

/// Consent store root (below HKCU for the user, HKLM machine-wide)
const CONSENT_STORE: &str =
    r"SOFTWARE\Microsoft\Windows\CurrentVersion\CapabilityAccessManager\ConsentStore";

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// Closes the wrapped handle on drop
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Closes the wrapped registry key on drop
struct OwnedKey(HKEY);

impl Drop for OwnedKey {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.0);
        }
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    OsString::from_wide(&buffer[..len])
        .to_string_lossy()
        .to_string()
}

fn open_process(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Result<OwnedHandle, ControlError> {
    unsafe {
        match OpenProcess(access, false, pid) {
            Ok(h) if !h.is_invalid() => Ok(OwnedHandle(h)),
            Ok(_) => Err(ControlError::NotFound(pid)),
            Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => {
                Err(ControlError::AccessDenied(pid))
            }
            Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => {
                Err(ControlError::NotFound(pid))
            }
            Err(e) => Err(ControlError::Os(e.message().to_string())),
        }
    }
}

/// Process table from a Toolhelp process snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolhelpProcessTable;

impl ProcessTable for ToolhelpProcessTable {
    fn snapshot(&self) -> Vec<ProcessEntry> {
        let mut processes = Vec::new();
        unsafe {
            let Ok(handle) = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) else {
                return processes;
            };
            if handle.is_invalid() {
                return processes;
            }
            let snapshot = OwnedHandle(handle);

            let mut entry = PROCESSENTRY32W {
                dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
                ..Default::default()
            };

            if Process32FirstW(snapshot.0, &mut entry).is_ok() {
                loop {
                    processes.push(ProcessEntry {
                        pid: entry.th32ProcessID,
                        name: from_wide(&entry.szExeFile),
                        start_time: None,
                    });
                    if Process32NextW(snapshot.0, &mut entry).is_err() {
                        break;
                    }
                }
            }
        }
        processes
    }

    fn is_running(&self, pid: u32) -> bool {
        let Ok(process) = open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION) else {
            return false;
        };
        let mut code = 0u32;
        unsafe {
            GetExitCodeProcess(process.0, &mut code).is_ok() && code == STILL_ACTIVE.0 as u32
        }
    }

    fn start_time(&self, pid: u32) -> Option<DateTime<Local>> {
        let process = open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION).ok()?;
        let mut creation = FILETIME::default();
        let mut exit = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();
        unsafe {
            GetProcessTimes(process.0, &mut creation, &mut exit, &mut kernel, &mut user).ok()?;
        }
        let ticks = ((creation.dwHighDateTime as u64) << 32) | creation.dwLowDateTime as u64;
        let secs = (ticks / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
        let nanos = ((ticks % 10_000_000) * 100) as u32;
        DateTime::from_timestamp(secs, nanos).map(|t| t.with_timezone(&Local))
    }
}

/// Thread IDs owned by `pid`
fn process_threads(pid: u32) -> Result<Vec<u32>, ControlError> {
    let mut threads = Vec::new();
    unsafe {
        let handle = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)
            .map_err(|e| ControlError::Os(e.message().to_string()))?;
        let snapshot = OwnedHandle(handle);

        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };

        if Thread32First(snapshot.0, &mut entry).is_ok() {
            loop {
                if entry.th32OwnerProcessID == pid {
                    threads.push(entry.th32ThreadID);
                }
                if Thread32Next(snapshot.0, &mut entry).is_err() {
                    break;
                }
            }
        }
    }
    Ok(threads)
}

/// Applies `op` to every thread of the process. Threads that exited or
/// refuse access are skipped; only an unresolvable process is an error.
fn for_each_thread(pid: u32, op: unsafe fn(HANDLE) -> u32) -> Result<(), ControlError> {
    // The process itself must resolve
    open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION)?;

    let threads = process_threads(pid)?;
    let mut touched = 0usize;
    for tid in &threads {
        unsafe {
            let Ok(handle) = OpenThread(THREAD_SUSPEND_RESUME, false, *tid) else {
                continue;
            };
            if handle.is_invalid() {
                continue;
            }
            let thread = OwnedHandle(handle);
            if op(thread.0) != u32::MAX {
                touched += 1;
            }
        }
    }
    debug!("PID {}: {}/{} threads handled", pid, touched, threads.len());
    Ok(())
}

unsafe fn suspend_thread(handle: HANDLE) -> u32 {
    SuspendThread(handle)
}

unsafe fn resume_thread(handle: HANDLE) -> u32 {
    ResumeThread(handle)
}

/// Suspends every thread of the process
pub fn suspend_process(pid: u32) -> Result<(), ControlError> {
    for_each_thread(pid, suspend_thread)
}

/// Resumes every thread of the process
pub fn resume_process(pid: u32) -> Result<(), ControlError> {
    for_each_thread(pid, resume_thread)
}

/// Terminates the process and waits up to `timeout` for it to exit
pub fn terminate_process(pid: u32, timeout: Duration) -> Result<(), ControlError> {
    let process = open_process(pid, PROCESS_TERMINATE | PROCESS_SYNCHRONIZE)?;
    unsafe {
        TerminateProcess(process.0, 1).map_err(|e| ControlError::Os(e.message().to_string()))?;
        let waited_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        if WaitForSingleObject(process.0, waited_ms) == WAIT_OBJECT_0 {
            Ok(())
        } else {
            Err(ControlError::Timeout {
                pid,
                waited_ms: waited_ms as u64,
            })
        }
    }
}

fn open_key(root: HKEY, path: &str) -> Result<OwnedKey, WIN32_ERROR> {
    let path = wide(path);
    let mut key = HKEY::default();
    unsafe {
        let status = RegOpenKeyExW(root, PCWSTR(path.as_ptr()), 0, KEY_READ, &mut key);
        if status == ERROR_SUCCESS {
            Ok(OwnedKey(key))
        } else {
            Err(status)
        }
    }
}

fn subkey_names(key: &OwnedKey) -> Vec<String> {
    let mut names = Vec::new();
    let mut index = 0u32;
    loop {
        let mut buffer = vec![0u16; 512];
        let mut len = buffer.len() as u32;
        let status = unsafe {
            RegEnumKeyExW(
                key.0,
                index,
                PWSTR(buffer.as_mut_ptr()),
                &mut len,
                None,
                PWSTR::null(),
                None,
                None,
            )
        };
        // ERROR_NO_MORE_ITEMS ends the walk
        if status != ERROR_SUCCESS {
            break;
        }
        names.push(from_wide(&buffer[..len as usize]));
        index += 1;
    }
    names
}

fn read_qword(key: &OwnedKey, value: &str) -> Option<u64> {
    let name = wide(value);
    let mut data = 0u64;
    let mut size = std::mem::size_of::<u64>() as u32;
    let status = unsafe {
        RegQueryValueExW(
            key.0,
            PCWSTR(name.as_ptr()),
            None,
            None,
            Some(&mut data as *mut u64 as *mut u8),
            Some(&mut size),
        )
    };
    (status == ERROR_SUCCESS).then_some(data)
}

/// Desktop-app consent records of the CapabilityAccessManager
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsentRegistry;

impl ConsentStore for ConsentRegistry {
    fn active_holders(&self, device: DeviceClass) -> Result<Vec<ActiveHolder>, ProbeError> {
        let path = format!(r"{}\{}\NonPackaged", CONSENT_STORE, device.store_key());
        let mut holders = Vec::new();
        let mut last_error = None;
        let mut opened = false;

        for root in [HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE] {
            let key = match open_key(root, &path) {
                Ok(key) => key,
                Err(status) => {
                    last_error = Some(status);
                    continue;
                }
            };
            opened = true;

            for name in subkey_names(&key) {
                let Ok(app) = open_key(key.0, &name) else {
                    continue;
                };
                if read_qword(&app, "LastUsedTimeStop") == Some(0) {
                    let holder = ActiveHolder::Executable(decode_consent_key(&name));
                    if !holders.contains(&holder) {
                        holders.push(holder);
                    }
                }
            }
        }

        if opened {
            return Ok(holders);
        }
        match last_error {
            Some(status) if status == ERROR_ACCESS_DENIED => Err(ProbeError::AccessDenied(path)),
            Some(status) if status == ERROR_FILE_NOT_FOUND => Err(ProbeError::NotFound(path)),
            Some(status) => Err(ProbeError::Os(format!("{:?} opening {}", status, path))),
            None => Ok(holders),
        }
    }
}

/// Loaded modules from a Toolhelp module snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolhelpModules;

impl ModuleInspector for ToolhelpModules {
    fn loaded_modules(&self, pid: u32) -> Result<Vec<String>, ProbeError> {
        let mut modules = Vec::new();
        unsafe {
            let handle = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid)
                .map_err(|e| {
                    if e.code() == ERROR_ACCESS_DENIED.to_hresult() {
                        ProbeError::AccessDenied(format!("pid {}", pid))
                    } else {
                        ProbeError::Os(e.message().to_string())
                    }
                })?;
            let snapshot = OwnedHandle(handle);

            let mut entry = MODULEENTRY32W {
                dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
                ..Default::default()
            };

            if Module32FirstW(snapshot.0, &mut entry).is_ok() {
                loop {
                    modules.push(from_wide(&entry.szModule));
                    if Module32NextW(snapshot.0, &mut entry).is_err() {
                        break;
                    }
                }
            }
        }
        Ok(modules)
    }
}
