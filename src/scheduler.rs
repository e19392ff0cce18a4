//! Detection Scheduler
//!
//! One scan cycle per tick: refresh media usage, re-check tracked PIDs,
//! discover new matches, reap whatever is no longer relevant. Events of a
//! cycle are published (and handed to the coordinator) before `tick`
//! returns, in the order near-limit/exceeded, detected, exited.

use crate::actions::ActionCoordinator;
use crate::clock::Clock;
use crate::config::{process_key, ConfigSource, ProcessConfig, WatchConfig};
use crate::events::{DetectionAction, EventBus, WatchEvent};
use crate::media::{MediaDeviceUsage, MediaUsageDetector};
use crate::registry::{MonitoredProcess, ProcessRegistry, Transition};
use crate::sys::{ProcessEntry, ProcessTable};
use chrono::{DateTime, Local};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Outcome of one scan cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Tracked processes after the cycle
    pub tracked: usize,
    pub detected: usize,
    pub exited: usize,
    pub events: usize,
    pub duration: Duration,
}

/// Everything a cycle reads, fixed at cycle start
struct CycleInput<'a> {
    config: &'a WatchConfig,
    now: DateTime<Local>,
    usage: HashMap<u32, MediaDeviceUsage>,
    processes: BTreeMap<u32, &'a ProcessEntry>,
    tracked: HashSet<u32>,
}

/// Resets the reentrancy flag, also when a cycle panics
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DetectionScheduler {
    table: Arc<dyn ProcessTable>,
    detector: Arc<MediaUsageDetector>,
    registry: Arc<ProcessRegistry>,
    coordinator: Arc<ActionCoordinator>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: Arc<dyn ConfigSource>,
    in_cycle: AtomicBool,
}

impl DetectionScheduler {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        detector: Arc<MediaUsageDetector>,
        registry: Arc<ProcessRegistry>,
        coordinator: Arc<ActionCoordinator>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            table,
            detector,
            registry,
            coordinator,
            bus,
            clock,
            config,
            in_cycle: AtomicBool::new(false),
        }
    }

    /// Runs one cycle, `None` if the previous one is still executing
    pub fn tick(&self) -> Option<CycleReport> {
        if self
            .in_cycle
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous cycle still running, tick skipped");
            return None;
        }
        let _guard = CycleGuard(&self.in_cycle);
        Some(self.run_cycle())
    }

    /// Whether a cycle is executing right now
    pub fn in_cycle(&self) -> bool {
        self.in_cycle.load(Ordering::Acquire)
    }

    fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let config = self.config.current();
        self.detector.apply_settings(&config.settings.detector);

        let enabled = config.enabled();
        let usage = if enabled.iter().any(|c| config.is_media_gated(c)) {
            self.detector
                .active_device_users()
                .into_iter()
                .map(|u| (u.pid, u))
                .collect()
        } else {
            HashMap::new()
        };

        let snapshot = self.table.snapshot();
        let tracked: Vec<u32> = self.registry.pids();
        let input = CycleInput {
            config: config.as_ref(),
            now: self.clock.now(),
            usage,
            processes: snapshot.iter().map(|p| (p.pid, p)).collect(),
            tracked: tracked.iter().copied().collect(),
        };

        // Fast path
        let checked = fan_out(&tracked, |&pid| (pid, self.check_tracked(pid, &input)));
        let mut relevant = HashSet::new();
        let mut seen = HashSet::new();
        let mut limit_events = Vec::new();
        for (pid, outcome) in checked {
            seen.insert(pid);
            if let Some(events) = outcome {
                relevant.insert(pid);
                limit_events.extend(events);
            }
        }

        // Discovery
        let detected_events: Vec<WatchEvent> = fan_out(&enabled, |cfg| self.discover(cfg, &input))
            .into_iter()
            .flatten()
            .collect();

        // Reap; PIDs lost with a failed worker wait for the next cycle
        let mut exited_events = Vec::new();
        for pid in tracked
            .iter()
            .filter(|pid| seen.contains(pid) && !relevant.contains(pid))
        {
            if let Some(process) = self.registry.reap(*pid) {
                self.detector.forget(*pid);
                exited_events.push(WatchEvent::ProcessDetected {
                    process,
                    action: DetectionAction::Exited,
                    media: None,
                });
            }
        }

        let detected = detected_events.len();
        let exited = exited_events.len();
        let events = limit_events.len() + detected + exited;

        for event in limit_events
            .into_iter()
            .chain(detected_events)
            .chain(exited_events)
        {
            self.dispatch(&event);
        }

        let report = CycleReport {
            tracked: self.registry.len(),
            detected,
            exited,
            events,
            duration: started.elapsed(),
        };
        debug!(
            "Cycle: {} tracked, {} detected, {} exited in {:?}",
            report.tracked, report.detected, report.exited, report.duration
        );
        report
    }

    /// Re-validates one tracked PID. `None` means not relevant this cycle.
    fn check_tracked(&self, pid: u32, input: &CycleInput) -> Option<Vec<WatchEvent>> {
        let current = self.registry.get(pid)?;
        let entry = input.processes.get(&pid)?;
        if process_key(&entry.name) != process_key(&current.name) {
            debug!(
                "PID {} is now {} (was {}), treating as a new process",
                pid, entry.name, current.name
            );
            return None;
        }
        let config = input.config.find_enabled(&current.name)?;
        let usage = if current.media_gated {
            Some(input.usage.get(&pid)?.clone())
        } else {
            None
        };

        let (process, transitions) = self.registry.refresh(pid, input.now, config, usage)?;
        let events = transitions
            .into_iter()
            .map(|transition| match transition {
                Transition::NearLimit { remaining } => WatchEvent::ProcessNearLimit {
                    process: process.clone(),
                    remaining,
                },
                Transition::Exceeded => WatchEvent::ProcessExceededLimit {
                    action: process.config.action_type,
                    process: process.clone(),
                },
            })
            .collect();
        Some(events)
    }

    /// New processes for one config
    fn discover(&self, config: &Arc<ProcessConfig>, input: &CycleInput) -> Vec<WatchEvent> {
        let key = process_key(&config.process_name);
        let gated = input.config.is_media_gated(config);
        let mut events = Vec::new();

        for entry in input
            .processes
            .values()
            .filter(|p| !input.tracked.contains(&p.pid))
            .filter(|p| process_key(&p.name) == key)
        {
            let media = if gated {
                match input.usage.get(&entry.pid) {
                    Some(usage) => Some(usage.clone()),
                    None => continue,
                }
            } else {
                None
            };

            // Media-gated runtime counts from the start of capture
            let start_time = if gated {
                input.now
            } else {
                entry
                    .start_time
                    .or_else(|| self.table.start_time(entry.pid))
                    .unwrap_or(input.now)
            };

            let mut process =
                MonitoredProcess::new(entry.pid, &entry.name, config.clone(), start_time, input.now);
            if gated {
                process = process.with_media(media.clone());
            }
            if let Some(detected) = self.registry.insert_new(process) {
                info!(
                    "Detected {} (PID {}){}",
                    detected.name,
                    detected.pid,
                    media
                        .as_ref()
                        .map(|m| format!(" using {}", m.devices()))
                        .unwrap_or_default()
                );
                events.push(WatchEvent::ProcessDetected {
                    process: detected,
                    action: DetectionAction::Detected,
                    media,
                });
            }
        }
        events
    }

    fn dispatch(&self, event: &WatchEvent) {
        self.bus.publish(event);
        self.coordinator.handle(event);
        // A terminate tears the entry down inside the coordinator
        if let WatchEvent::ProcessExceededLimit { process, .. } = event {
            if !self.registry.contains(process.pid) {
                self.detector.forget(process.pid);
            }
        }
    }
}

/// Maps `items` on scoped worker threads, at most one per CPU, keeping order
fn fan_out<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(items.len());
    if workers <= 1 {
        return items.iter().map(f).collect();
    }

    let chunk_size = items.len().div_ceil(workers);
    let f = &f;
    thread::scope(|scope| {
        let handles: Vec<_> = items
            .chunks(chunk_size)
            .map(|chunk| {
                let handle = scope.spawn(move || chunk.iter().map(f).collect::<Vec<R>>());
                (chunk.len(), handle)
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|(len, handle)| match handle.join() {
                Ok(results) => results,
                Err(_) => {
                    error!("Scan worker panicked, {} item(s) skipped", len);
                    Vec::new()
                }
            })
            .collect()
    })
}
