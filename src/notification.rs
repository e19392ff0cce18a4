//! Notifications and Alerts
//!
//! Start alerts and the continuous "capture tool running" alert. The engine
//! only sees `AlertFactory`/`AlertSink`; the default sink logs and can hand
//! the alert to an external toast helper.

use crate::config::{AlertConfig, WatchConfig};
use crate::media::MediaDeviceUsage;
use std::io;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Alert handle for one tracked process
pub trait AlertSink: Send {
    fn show_start_alert(
        &mut self,
        process_name: &str,
        display_name: &str,
        media: Option<&MediaDeviceUsage>,
    );
    fn show_continuous_alert(&mut self);
    fn hide_continuous_alert(&mut self);
}

/// Creates one alert handle per tracked PID
pub trait AlertFactory: Send + Sync {
    fn create(&self, config: &AlertConfig) -> Box<dyn AlertSink>;
}

/// Fills {ProcessName}, {DisplayName}, {Camera}, {Microphone} and {Devices}
pub fn render_template(
    template: &str,
    process_name: &str,
    display_name: &str,
    media: Option<&MediaDeviceUsage>,
) -> String {
    let camera = media.filter(|m| m.camera).map(|_| "camera").unwrap_or("");
    let microphone = media
        .filter(|m| m.microphone)
        .map(|_| "microphone")
        .unwrap_or("");
    let devices = [camera, microphone]
        .iter()
        .filter(|d| !d.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" and ");

    template
        .replace("{ProcessName}", process_name)
        .replace("{DisplayName}", display_name)
        .replace("{Camera}", camera)
        .replace("{Microphone}", microphone)
        .replace("{Devices}", &devices)
}

/// Default factory: alerts go to the log and, if configured, to a helper
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerts;

impl AlertFactory for TracingAlerts {
    fn create(&self, config: &AlertConfig) -> Box<dyn AlertSink> {
        Box::new(TracingAlert {
            config: config.clone(),
            continuous: false,
        })
    }
}

/// Starts the toast helper; the returned thread waits for it to exit
fn spawn_helper(command: &str, title: &str, message: &str) -> io::Result<JoinHandle<()>> {
    let mut child = Command::new(command)
        .args(["-title", title, "-message", message])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let command = command.to_string();
    Ok(thread::spawn(move || match child.wait() {
        Ok(status) => debug!("Notification helper {} exited: {}", command, status),
        Err(e) => warn!("Could not wait for notification helper {}: {}", command, e),
    }))
}

struct TracingAlert {
    config: AlertConfig,
    continuous: bool,
}

impl AlertSink for TracingAlert {
    fn show_start_alert(
        &mut self,
        process_name: &str,
        display_name: &str,
        media: Option<&MediaDeviceUsage>,
    ) {
        if !self.config.enable_startup_notification {
            return;
        }
        let title = render_template(&self.config.notification_title, process_name, display_name, media);
        let message =
            render_template(&self.config.notification_message, process_name, display_name, media);
        warn!("ALERT: {} | {}", title, message.replace('\n', " "));

        if let Some(command) = &self.config.notification_command {
            if let Err(e) = spawn_helper(command, &title, &message) {
                warn!("Could not start notification helper {}: {}", command, e);
            }
        }
    }

    fn show_continuous_alert(&mut self) {
        if self.config.enable_continuous_alert && !self.continuous {
            self.continuous = true;
            info!("Continuous alert shown: {}", self.config.continuous_alert_text);
        }
    }

    fn hide_continuous_alert(&mut self) {
        if self.continuous {
            self.continuous = false;
            info!("Continuous alert hidden");
        }
    }
}

impl Drop for TracingAlert {
    fn drop(&mut self) {
        self.hide_continuous_alert();
    }
}

/// Shows start info (log only)
pub fn show_start_notification(config: &WatchConfig) {
    info!("=== Media Watchdog started ===");
    for process in config.enabled() {
        let gate = if config.is_media_gated(&process) {
            "while capturing"
        } else {
            "while running"
        };
        info!(
            "Watching {} ({}), {}s budget, action {}",
            process.process_name,
            gate,
            process.max_runtime.as_secs(),
            process.action_type.as_str()
        );
    }
    if !config.settings.enable_auto_action {
        info!("Automatic actions are disabled");
    }
}

/// Shows stop info (log only)
pub fn show_stop_notification() {
    info!("=== Media Watchdog ended ===");
}
