//! Watch Events
//!
//! Everything the engine reports goes out as a `WatchEvent` over crossbeam
//! channels. Subscribers (activity log, console, tests) each get their own
//! receiver.

use crate::config::ActionType;
use crate::media::MediaDeviceUsage;
use crate::registry::MonitoredProcess;
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::warn;

/// Queue depth per subscriber
const SUBSCRIBER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionAction {
    Detected,
    Exited,
}

/// Control operation named in `ActionFailed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Suspend,
    Resume,
    Terminate,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Suspend => "Suspend",
            ControlAction::Resume => "Resume",
            ControlAction::Terminate => "Terminate",
        }
    }
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    ProcessDetected {
        process: MonitoredProcess,
        action: DetectionAction,
        media: Option<MediaDeviceUsage>,
    },
    ProcessNearLimit {
        process: MonitoredProcess,
        remaining: Duration,
    },
    ProcessExceededLimit {
        process: MonitoredProcess,
        action: ActionType,
    },
    ProcessSuspended {
        process: MonitoredProcess,
        resume_at: Option<DateTime<Local>>,
    },
    ProcessResumed {
        process: MonitoredProcess,
        manual: bool,
    },
    ProcessTerminated {
        process: MonitoredProcess,
    },
    ActionFailed {
        process: MonitoredProcess,
        operation: ControlAction,
    },
}

impl WatchEvent {
    /// Short event kind for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::ProcessDetected {
                action: DetectionAction::Detected,
                ..
            } => "Detected",
            WatchEvent::ProcessDetected {
                action: DetectionAction::Exited,
                ..
            } => "Exited",
            WatchEvent::ProcessNearLimit { .. } => "NearLimit",
            WatchEvent::ProcessExceededLimit { .. } => "Exceeded",
            WatchEvent::ProcessSuspended { .. } => "Suspended",
            WatchEvent::ProcessResumed { .. } => "Resumed",
            WatchEvent::ProcessTerminated { .. } => "Terminated",
            WatchEvent::ActionFailed { .. } => "ActionFailed",
        }
    }

    pub fn process(&self) -> &MonitoredProcess {
        match self {
            WatchEvent::ProcessDetected { process, .. }
            | WatchEvent::ProcessNearLimit { process, .. }
            | WatchEvent::ProcessExceededLimit { process, .. }
            | WatchEvent::ProcessSuspended { process, .. }
            | WatchEvent::ProcessResumed { process, .. }
            | WatchEvent::ProcessTerminated { process }
            | WatchEvent::ActionFailed { process, .. } => process,
        }
    }

    pub fn pid(&self) -> u32 {
        self.process().pid
    }

    /// Free-text detail line
    pub fn detail(&self) -> String {
        let process = self.process();
        match self {
            WatchEvent::ProcessDetected {
                action: DetectionAction::Detected,
                media,
                ..
            } => match media {
                Some(usage) => format!("{} started using {}", process.display_name, usage.devices()),
                None => format!("{} is running", process.display_name),
            },
            WatchEvent::ProcessDetected {
                action: DetectionAction::Exited,
                ..
            } => format!(
                "{} no longer tracked after {}s",
                process.display_name,
                process.runtime.as_secs()
            ),
            WatchEvent::ProcessNearLimit { remaining, .. } => format!(
                "{}s left of {}s",
                remaining.as_secs(),
                process.config.max_runtime.as_secs()
            ),
            WatchEvent::ProcessExceededLimit { action, .. } => format!(
                "ran {}s of {}s allowed, action {}",
                process.runtime.as_secs(),
                process.config.max_runtime.as_secs(),
                action.as_str()
            ),
            WatchEvent::ProcessSuspended { resume_at, .. } => match resume_at {
                Some(at) => format!("suspended until {}", at.format("%H:%M:%S")),
                None => "suspended until resumed manually".to_string(),
            },
            WatchEvent::ProcessResumed { manual, .. } => {
                if *manual {
                    "resumed manually".to_string()
                } else {
                    "resumed automatically".to_string()
                }
            }
            WatchEvent::ProcessTerminated { .. } => "terminated".to_string(),
            WatchEvent::ActionFailed { operation, .. } => {
                format!("{} failed", operation.as_str())
            }
        }
    }
}

/// Fan-out of events to channel subscribers
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<WatchEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<WatchEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Never blocks; a full subscriber loses the event, a dropped one is removed
    pub fn publish(&self, event: &WatchEvent) {
        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Event queue full, {} dropped", event.kind());
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    /// Drops every subscriber so their receivers disconnect
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
