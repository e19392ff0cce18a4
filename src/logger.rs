//! Logging System
//!
//! `tracing` setup for diagnostics, plus the activity log: a worker thread
//! that receives watch events over a channel and appends them as JSON lines.

use crate::events::WatchEvent;
use anyhow::Result;
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Activity log file name
const ACTIVITY_FILE_NAME: &str = "activity_log.jsonl";

/// Flush after this many entries, or whenever the queue goes idle
const FLUSH_INTERVAL: u64 = 10;
const IDLE_FLUSH: Duration = Duration::from_secs(1);

/// Keeps the non-blocking file writer alive for the process lifetime
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Log directory (next to EXE)
pub fn get_log_dir() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            return exe_dir.join("logs");
        }
    }
    // Fallback: current working directory
    PathBuf::from(".").join("logs")
}

/// Default activity log path
pub fn activity_log_path() -> PathBuf {
    get_log_dir().join(ACTIVITY_FILE_NAME)
}

/// Initializes the console logger
pub fn init_console_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .try_init()?;

    Ok(())
}

/// Initializes the file logger (app.log for diagnostics)
pub fn init_file_logger() -> Result<()> {
    let log_dir = get_log_dir();
    fs::create_dir_all(&log_dir)?;

    // Keep only the two newest app.log files
    cleanup_old_logs(&log_dir, 2, "app.log");

    let file_appender = tracing_appender::rolling::daily(&log_dir, "app.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = FILE_GUARD.set(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(false)
                .with_ansi(false),
        )
        .with(filter)
        .try_init()?;

    Ok(())
}

/// One line of the activity log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub timestamp: DateTime<Local>,
    pub event_type: String,
    pub process_name: String,
    pub pid: u32,
    pub details: String,
}

impl ActivityEntry {
    pub fn from_event(event: &WatchEvent, timestamp: DateTime<Local>) -> Self {
        let process = event.process();
        Self {
            timestamp,
            event_type: event.kind().to_string(),
            process_name: process.name.clone(),
            pid: process.pid,
            details: event.detail(),
        }
    }

    fn session(event_type: &str, details: String) -> Self {
        Self {
            timestamp: Local::now(),
            event_type: event_type.to_string(),
            process_name: "media_watchdog".to_string(),
            pid: std::process::id(),
            details,
        }
    }

    /// Formats the entry for console
    pub fn format_console(&self) -> String {
        format!(
            "[{}] {:<12} {:<20} PID {:<6} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.event_type,
            self.process_name,
            self.pid,
            self.details
        )
    }
}

/// Settings of the activity log worker
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub path: PathBuf,
    pub console_output: bool,
    /// Also record near-limit warnings. Shared so config reloads apply to a
    /// running worker.
    pub detailed: Arc<AtomicBool>,
    /// Drop entries older than this many days at start
    pub retention_days: Option<u32>,
}

/// Deletes old log files with specific prefix, keeps only the newest N
fn cleanup_old_logs(log_dir: &Path, keep_count: usize, prefix: &str) {
    if let Ok(entries) = fs::read_dir(log_dir) {
        let mut log_files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| name.starts_with(prefix))
                    .unwrap_or(false)
            })
            .collect();

        // Newest first
        log_files.sort_by(|a, b| {
            let time_a = a.metadata().and_then(|m| m.modified()).ok();
            let time_b = b.metadata().and_then(|m| m.modified()).ok();
            time_b.cmp(&time_a)
        });

        for old_file in log_files.iter().skip(keep_count) {
            if let Err(e) = fs::remove_file(old_file.path()) {
                error!("Could not delete old log file: {}", e);
            } else {
                info!("Old log file deleted: {}", old_file.path().display());
            }
        }
    }
}

/// Reads the activity log, skipping corrupt lines
pub fn load_activity(path: &Path) -> Result<Vec<ActivityEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<ActivityEntry>(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Rewrites the activity log without entries older than `days`.
/// Returns the number of removed entries.
pub fn prune_activity(path: &Path, days: u32, now: DateTime<Local>) -> Result<usize> {
    let entries = load_activity(path)?;
    let cutoff = now - chrono::Duration::days(days as i64);
    let kept: Vec<&ActivityEntry> = entries.iter().filter(|e| e.timestamp > cutoff).collect();
    let removed = entries.len() - kept.len();
    if removed == 0 {
        return Ok(0);
    }

    let mut writer = BufWriter::new(fs::File::create(path)?);
    for entry in kept {
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(removed)
}

fn write_entry(writer: &mut impl Write, entry: &ActivityEntry) {
    let result = serde_json::to_writer(&mut *writer, entry)
        .map_err(anyhow::Error::from)
        .and_then(|_| writer.write_all(b"\n").map_err(anyhow::Error::from));
    if let Err(e) = result {
        error!("Error writing activity entry: {}", e);
    }
}

fn print_colored(entry: &ActivityEntry) {
    let line = entry.format_console();
    match entry.event_type.as_str() {
        "Detected" => println!("\x1b[96m{}\x1b[0m", line),   // Cyan
        "NearLimit" => println!("\x1b[93m{}\x1b[0m", line),  // Yellow
        "Exceeded" => println!("\x1b[91m{}\x1b[0m", line),   // Red
        "Suspended" => println!("\x1b[95m{}\x1b[0m", line),  // Magenta
        "Resumed" => println!("\x1b[92m{}\x1b[0m", line),    // Green
        "Terminated" => println!("\x1b[91m{}\x1b[0m", line), // Red
        "ActionFailed" => println!("\x1b[41m{}\x1b[0m", line),
        "Exited" => println!("\x1b[90m{}\x1b[0m", line), // Gray
        _ => println!("{}", line),
    }
}

/// Activity log worker thread. Runs until every sender is dropped and
/// returns the number of events written.
pub fn activity_worker(receiver: Receiver<WatchEvent>, options: ActivityOptions) -> u64 {
    info!("Activity log worker started");

    if let Some(parent) = options.path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            error!("Could not create log directory: {}", e);
            return 0;
        }
    }

    if let Some(days) = options.retention_days {
        match prune_activity(&options.path, days, Local::now()) {
            Ok(0) => {}
            Ok(removed) => info!("{} activity entries older than {} days removed", removed, days),
            Err(e) => warn!("Could not prune activity log: {}", e),
        }
    }

    let file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&options.path)
    {
        Ok(f) => f,
        Err(e) => {
            error!("Could not open activity log: {}", e);
            return 0;
        }
    };
    let mut writer = BufWriter::new(file);

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default();
    let user = std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_default();
    write_entry(
        &mut writer,
        &ActivityEntry::session("SessionStart", format!("computer {}, user {}", host, user)),
    );
    let _ = writer.flush();

    if options.console_output {
        println!("\n{}", "═".repeat(80));
        println!("Activity log: {}", options.path.display());
        println!("{}\n", "═".repeat(80));
    }
    info!("Activity log: {}", options.path.display());

    let mut entry_count = 0u64;
    loop {
        let event = match receiver.recv_timeout(IDLE_FLUSH) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                let _ = writer.flush();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if !options.detailed.load(Ordering::Relaxed)
            && matches!(event, WatchEvent::ProcessNearLimit { .. }) {
            continue;
        }

        let entry = ActivityEntry::from_event(&event, Local::now());
        write_entry(&mut writer, &entry);
        if options.console_output {
            print_colored(&entry);
        }

        entry_count += 1;
        if entry_count % FLUSH_INTERVAL == 0 {
            let _ = writer.flush();
        }
    }

    write_entry(
        &mut writer,
        &ActivityEntry::session("SessionEnd", format!("{} events", entry_count)),
    );
    let _ = writer.flush();

    info!("Activity log worker ended ({} entries)", entry_count);
    entry_count
}
