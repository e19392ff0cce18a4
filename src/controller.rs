//! Process Control
//!
//! Suspend, resume and terminate by PID. Callers only learn success or
//! failure; the reason is logged here.

use crate::sys::{self, ControlError, ProcessTable};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Wait for exit after a terminate request
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort control of a running process
pub trait ProcessControl: Send + Sync {
    fn suspend(&self, pid: u32) -> bool;
    fn resume(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32) -> bool;
    fn is_running(&self, pid: u32) -> bool;
}

/// Controller backed by the native OS primitives
pub struct NativeController {
    table: Arc<dyn ProcessTable>,
    terminate_timeout: Duration,
}

impl NativeController {
    pub fn new(table: Arc<dyn ProcessTable>) -> Self {
        Self {
            table,
            terminate_timeout: TERMINATE_TIMEOUT,
        }
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }
}

fn report(operation: &str, pid: u32, result: Result<(), ControlError>) -> bool {
    match result {
        Ok(()) => {
            info!("{} PID {}: ok", operation, pid);
            true
        }
        Err(e) => {
            warn!("{} PID {} failed: {}", operation, pid, e);
            false
        }
    }
}

impl ProcessControl for NativeController {
    fn suspend(&self, pid: u32) -> bool {
        report("Suspend", pid, sys::suspend_process(pid))
    }

    fn resume(&self, pid: u32) -> bool {
        report("Resume", pid, sys::resume_process(pid))
    }

    fn terminate(&self, pid: u32) -> bool {
        report(
            "Terminate",
            pid,
            sys::terminate_process(pid, self.terminate_timeout),
        )
    }

    fn is_running(&self, pid: u32) -> bool {
        self.table.is_running(pid)
    }
}
