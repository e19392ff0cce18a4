//! Media Watchdog - capture tool runtime enforcement
//!
//! Runs in the background by default.
//! For autostart: Use Task Scheduler.

// Only show console in console mode
#![cfg_attr(windows, windows_subsystem = "windows")]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use media_watchdog::config::{default_config_path, ConfigStore};
use media_watchdog::controller::{NativeController, ProcessControl};
use media_watchdog::logger;
use media_watchdog::sys;
use media_watchdog::watchdog::{self, Watchdog};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Media Watchdog - enforces runtime budgets on capture tools
#[derive(Parser)]
#[command(name = "media_watchdog")]
#[command(about = "Watches capture tools and camera/microphone usage")]
struct Cli {
    /// Configuration file (default: watchdog.json next to the EXE)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run with console window (for debugging)
    Console,
    /// Print the processes currently using camera or microphone
    Devices,
    /// Run one detection cycle and print the tracked processes
    Status,
    /// Suspend every thread of a process
    Suspend { pid: u32 },
    /// Resume a suspended process
    Resume { pid: u32 },
    /// Terminate a process
    Terminate { pid: u32 },
    /// Print the activity log
    Log {
        /// Only the newest N entries
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Set up Task Scheduler autostart
    Install,
    /// Remove Task Scheduler autostart
    Uninstall,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Some(Commands::Console) => {
            // Create own console (don't attach to parent)
            alloc_console();

            logger::init_console_logger()?;
            info!("Media Watchdog started in console mode");
            info!("Press CTRL+C to exit");

            let config = Arc::new(ConfigStore::load(&config_path)?);
            watchdog::run_until_ctrl_c(config, true)?;
        }
        Some(Commands::Devices) => {
            attach_console();
            logger::init_console_logger()?;
            let config = Arc::new(ConfigStore::load(&config_path)?);
            let watchdog = Watchdog::new(config);

            let users = watchdog.detector().active_device_users();
            if users.is_empty() {
                println!("No process is using camera or microphone.");
            }
            for usage in users {
                println!("{:<8} {:<30} {}", usage.pid, usage.process_name, usage.devices());
            }
        }
        Some(Commands::Status) => {
            attach_console();
            logger::init_console_logger()?;
            let config = Arc::new(ConfigStore::load(&config_path)?);
            let watchdog = Watchdog::new(config);
            watchdog.scan_once();

            let snapshot = watchdog.registry().snapshot();
            if snapshot.is_empty() {
                println!("No monitored process is running.");
            }
            for process in snapshot.values() {
                let devices = process
                    .media_usage
                    .as_ref()
                    .map(|u| u.devices())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<8} {:<30} {:<10} limit {}s, {}",
                    process.pid,
                    process.display_name,
                    process.status.as_str(),
                    process.config.max_runtime.as_secs(),
                    devices
                );
            }
        }
        Some(Commands::Suspend { pid }) => {
            attach_console();
            logger::init_console_logger()?;
            control(pid, "suspend", |c| c.suspend(pid))?;
        }
        Some(Commands::Resume { pid }) => {
            attach_console();
            logger::init_console_logger()?;
            control(pid, "resume", |c| c.resume(pid))?;
        }
        Some(Commands::Terminate { pid }) => {
            attach_console();
            logger::init_console_logger()?;
            control(pid, "terminate", |c| c.terminate(pid))?;
        }
        Some(Commands::Log { tail }) => {
            attach_console();
            let entries = logger::load_activity(&logger::activity_log_path())?;
            let skip = tail.map(|n| entries.len().saturating_sub(n)).unwrap_or(0);
            for entry in entries.iter().skip(skip) {
                println!("{}", entry.format_console());
            }
        }
        Some(Commands::Install) => {
            install_autostart(cli.config.as_deref())?;
        }
        Some(Commands::Uninstall) => {
            uninstall_autostart()?;
        }
        None => {
            // Normal start (without console) - for autostart
            logger::init_file_logger()?;
            info!("Media Watchdog started");

            let config = Arc::new(ConfigStore::load(&config_path)?);
            watchdog::run_until_ctrl_c(config, false)?;
        }
    }

    Ok(())
}

/// Runs one control operation against the native backend
fn control(pid: u32, operation: &str, op: impl Fn(&dyn ProcessControl) -> bool) -> Result<()> {
    let controller = NativeController::new(sys::native_process_table());
    if !op(&controller) {
        bail!("Could not {} process {}", operation, pid);
    }
    println!("Process {}: {} done", pid, operation);
    Ok(())
}

#[cfg(windows)]
fn alloc_console() {
    use windows::Win32::System::Console::AllocConsole;
    unsafe {
        let _ = AllocConsole();
    }
}

#[cfg(not(windows))]
fn alloc_console() {}

/// Console for output
#[cfg(windows)]
fn attach_console() {
    use windows::Win32::System::Console::{AllocConsole, AttachConsole, ATTACH_PARENT_PROCESS};
    unsafe {
        if AttachConsole(ATTACH_PARENT_PROCESS).is_err() {
            let _ = AllocConsole();
        }
    }
}

#[cfg(not(windows))]
fn attach_console() {}

/// Sets up autostart via Task Scheduler
#[cfg(windows)]
fn install_autostart(config: Option<&std::path::Path>) -> Result<()> {
    attach_console();

    let exe_path = std::env::current_exe()?;
    let mut command_line = format!("\"{}\"", exe_path.to_string_lossy());
    if let Some(config) = config {
        command_line.push_str(&format!(" --config \"{}\"", config.display()));
    }

    println!("Setting up autostart...");

    let output = std::process::Command::new("schtasks")
        .args([
            "/Create",
            "/TN", "MediaWatchdog",
            "/TR", &command_line,
            "/SC", "ONLOGON",
            "/RL", "HIGHEST",
            "/F",
        ])
        .output()?;

    if output.status.success() {
        println!("Autostart configured!");
        println!("Media Watchdog will start automatically at logon.");
        println!();
        println!("Starting Media Watchdog now...");

        // Start program directly (no subcommand = normal mode)
        let mut start = std::process::Command::new(&exe_path);
        if let Some(config) = config {
            start.arg("--config").arg(config);
        }
        let _ = start.spawn();

        println!();
        println!("To remove: media_watchdog uninstall");
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        println!("Error setting up: {}", stderr);
        println!();
        println!("Tip: Run as administrator!");
    }

    Ok(())
}

#[cfg(not(windows))]
fn install_autostart(_config: Option<&std::path::Path>) -> Result<()> {
    bail!("Autostart is only available on Windows")
}

/// Removes autostart
#[cfg(windows)]
fn uninstall_autostart() -> Result<()> {
    attach_console();

    println!("Removing autostart...");

    let output = std::process::Command::new("schtasks")
        .args(["/Delete", "/TN", "MediaWatchdog", "/F"])
        .output()?;

    if output.status.success() {
        println!("Autostart removed!");
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("existiert nicht") || stderr.contains("does not exist") {
            println!("No autostart task found.");
        } else {
            println!("Error: {}", stderr);
        }
    }

    Ok(())
}

#[cfg(not(windows))]
fn uninstall_autostart() -> Result<()> {
    bail!("Autostart is only available on Windows")
}
