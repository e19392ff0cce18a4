//! Configuration
//!
//! Watch list, alert settings and engine tuning, stored as camelCase JSON
//! next to the executable. The engine only ever reads a snapshot
//! (`Arc<WatchConfig>`); the store swaps the whole snapshot on reload.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{info, warn};

/// Name of the config file next to the EXE
const CONFIG_FILE_NAME: &str = "watchdog.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What happens once a process runs past its budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActionType {
    None,
    #[default]
    Suspend,
    Terminate,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::None => "None",
            ActionType::Suspend => "Suspend",
            ActionType::Terminate => "Terminate",
        }
    }
}

/// How long the continuous alert stays up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlertUntil {
    #[default]
    ProcessEnd,
    ProcessSuspend,
}

/// Durations are stored as whole seconds
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Settings for one watched executable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessConfig {
    pub process_name: String,
    pub display_name: String,
    pub description: String,
    pub is_enabled: bool,
    /// Zero disables the runtime budget
    #[serde(rename = "maxRuntimeSecs", with = "secs")]
    pub max_runtime: Duration,
    pub action_type: ActionType,
    /// Zero means manual resume only
    #[serde(rename = "autoResumeAfterSecs", with = "secs")]
    pub auto_resume_after: Duration,
    /// Warning lead time in seconds
    #[serde(rename = "alertBeforeActionSecs")]
    pub alert_before_action: u64,
    /// Overrides `mediaProcessNames` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_gated: Option<bool>,
    /// Falls back to the global alert config when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_config: Option<AlertConfig>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            process_name: String::new(),
            display_name: String::new(),
            description: String::new(),
            is_enabled: true,
            max_runtime: Duration::from_secs(30 * 60),
            action_type: ActionType::Suspend,
            auto_resume_after: Duration::from_secs(5 * 60),
            alert_before_action: 30,
            media_gated: None,
            alert_config: None,
        }
    }
}

impl ProcessConfig {
    pub fn new(process_name: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            display_name: process_name.to_string(),
            ..Default::default()
        }
    }

    pub fn alert_lead(&self) -> Duration {
        Duration::from_secs(self.alert_before_action)
    }

    /// Name shown to the user, falls back to the executable name
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.process_name
        } else {
            &self.display_name
        }
    }
}

/// Notification settings (global or per process)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertConfig {
    pub enable_startup_notification: bool,
    /// Supports {ProcessName}, {DisplayName}
    pub notification_title: String,
    /// Supports {ProcessName}, {DisplayName}, {Camera}, {Microphone}, {Devices}
    pub notification_message: String,
    /// External helper started with `-title` / `-message`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_command: Option<String>,
    pub enable_continuous_alert: bool,
    pub continuous_alert_text: String,
    pub continuous_alert_until: AlertUntil,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enable_startup_notification: true,
            notification_title: "Media Watchdog - process monitor".to_string(),
            notification_message: "Watched process detected\n{DisplayName} {Devices}".to_string(),
            notification_command: None,
            enable_continuous_alert: true,
            continuous_alert_text: "A watched capture tool is running".to_string(),
            continuous_alert_until: AlertUntil::ProcessEnd,
        }
    }
}

/// Tuning of the media usage detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectorSettings {
    /// Minimum gap between two consent store reads
    pub registry_poll_interval_ms: u64,
    /// Minimum gap between two module sweeps
    pub full_scan_interval_secs: u64,
    /// Modules inspected per process once a match was found
    pub max_modules_checked: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            registry_poll_interval_ms: 500,
            full_scan_interval_secs: 5,
            max_modules_checked: 50,
        }
    }
}

impl DetectorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.registry_poll_interval_ms)
    }

    pub fn full_scan_interval(&self) -> Duration {
        Duration::from_secs(self.full_scan_interval_secs)
    }
}

/// Application-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub monitor_interval_secs: u64,
    pub enable_auto_action: bool,
    pub enable_detailed_logging: bool,
    pub log_retention_days: u32,
    pub auto_clean_logs: bool,
    /// Presentation refresh, independent of detection
    pub ui_refresh_secs: u64,
    /// Executables tracked only while they hold the camera or microphone
    pub media_process_names: Vec<String>,
    pub detector: DetectorSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 1,
            enable_auto_action: true,
            enable_detailed_logging: true,
            log_retention_days: 30,
            auto_clean_logs: true,
            ui_refresh_secs: 2,
            media_process_names: [
                "media_capture.exe",
                "WeChat.exe",
                "QQ.exe",
                "DingTalk.exe",
                "Zoom.exe",
                "Teams.exe",
                "Skype.exe",
                "chrome.exe",
                "msedge.exe",
                "firefox.exe",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            detector: DetectorSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn ui_refresh(&self) -> Duration {
        Duration::from_secs(self.ui_refresh_secs.max(1))
    }
}

/// One complete configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    pub process_configs: BTreeMap<String, Arc<ProcessConfig>>,
    pub alert_config: AlertConfig,
    pub settings: AppSettings,
}

impl Default for WatchConfig {
    fn default() -> Self {
        let mut process_configs = BTreeMap::new();
        let defaults = [
            ("media_capture.exe", "Camera capture", "Captures camera and microphone", ActionType::Suspend, 5 * 60),
            ("screenCapture.exe", "Screen capture", "Captures the current screen contents", ActionType::Suspend, 5 * 60),
            ("rtcRemoteDesktop.exe", "Remote desktop", "Remote control of this computer", ActionType::Terminate, 0),
        ];
        for (name, display, description, action, resume_secs) in defaults {
            process_configs.insert(
                name.to_string(),
                Arc::new(ProcessConfig {
                    process_name: name.to_string(),
                    display_name: display.to_string(),
                    description: description.to_string(),
                    action_type: action,
                    auto_resume_after: Duration::from_secs(resume_secs),
                    ..Default::default()
                }),
            );
        }

        Self {
            process_configs,
            alert_config: AlertConfig::default(),
            settings: AppSettings::default(),
        }
    }
}

impl WatchConfig {
    /// Empty watch list with default settings
    pub fn empty() -> Self {
        Self {
            process_configs: BTreeMap::new(),
            ..Default::default()
        }
    }

    /// Adds (or replaces) a watched executable
    pub fn with_process(mut self, config: ProcessConfig) -> Self {
        self.process_configs
            .insert(config.process_name.clone(), Arc::new(config));
        self
    }

    /// All enabled configs
    pub fn enabled(&self) -> Vec<Arc<ProcessConfig>> {
        self.process_configs
            .values()
            .filter(|c| c.is_enabled && !c.process_name.is_empty())
            .cloned()
            .collect()
    }

    /// Enabled config for an executable name (case-insensitive, `.exe` optional)
    pub fn find_enabled(&self, process_name: &str) -> Option<Arc<ProcessConfig>> {
        let key = process_key(process_name);
        self.process_configs
            .values()
            .find(|c| c.is_enabled && process_key(&c.process_name) == key)
            .cloned()
    }

    /// Whether tracking of this executable is conditioned on device usage
    pub fn is_media_gated(&self, config: &ProcessConfig) -> bool {
        if let Some(gated) = config.media_gated {
            return gated;
        }
        let key = process_key(&config.process_name);
        self.settings
            .media_process_names
            .iter()
            .any(|name| process_key(name) == key)
    }

    pub fn alert_config_for<'a>(&'a self, config: &'a ProcessConfig) -> &'a AlertConfig {
        config.alert_config.as_ref().unwrap_or(&self.alert_config)
    }
}

/// Comparable process name: file name only, lowercase, without `.exe`
pub fn process_key(name: &str) -> String {
    let file = name.rsplit(['\\', '/']).next().unwrap_or(name);
    let lower = file.to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Anything that hands out the current configuration snapshot
pub trait ConfigSource: Send + Sync {
    fn current(&self) -> Arc<WatchConfig>;
}

/// Hot-swappable configuration, optionally backed by a file
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<WatchConfig>>,
    modified: Mutex<Option<SystemTime>>,
}

impl ConfigSource for ConfigStore {
    fn current(&self) -> Arc<WatchConfig> {
        self.current.read().clone()
    }
}

impl ConfigStore {
    /// Store without a backing file
    pub fn in_memory(config: WatchConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            modified: Mutex::new(None),
        }
    }

    /// Loads the file, writing the defaults first if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            read_config(path)?
        } else {
            let config = WatchConfig::default();
            write_config(path, &config)?;
            info!("Default configuration written to {}", path.display());
            config
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(config)),
            modified: Mutex::new(modified_time(path)),
        })
    }

    /// Swaps the snapshot; running cycles keep the one they started with
    pub fn replace(&self, config: WatchConfig) {
        *self.current.write() = Arc::new(config);
    }

    /// Re-reads the file when its modification time changed.
    /// A broken file keeps the previous snapshot.
    pub fn reload_if_changed(&self) -> Result<bool, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let modified = modified_time(path);
        {
            let last = self.modified.lock();
            if modified.is_none() || *last == modified {
                return Ok(false);
            }
        }

        // A broken file is reported once per change
        *self.modified.lock() = modified;
        let config = read_config(path)?;
        *self.current.write() = Arc::new(config);
        info!("Configuration reloaded from {}", path.display());
        Ok(true)
    }
}

/// Default config path (next to the EXE)
pub fn default_config_path() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            return exe_dir.join(CONFIG_FILE_NAME);
        }
    }
    PathBuf::from(CONFIG_FILE_NAME)
}

fn read_config(path: &Path) -> Result<WatchConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: WatchConfig =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    for (key, process) in &config.process_configs {
        if process_key(key) != process_key(&process.process_name) {
            warn!(
                "Config key {} does not match processName {}, the processName wins",
                key, process.process_name
            );
        }
    }
    Ok(config)
}

fn write_config(path: &Path, config: &WatchConfig) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(io_err)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "media_watchdog_{}_{}_{}.json",
            name,
            std::process::id(),
            chrono::Local::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[test]
    fn process_key_ignores_case_path_and_extension() {
        assert_eq!(process_key("Zoom.exe"), "zoom");
        assert_eq!(process_key("ZOOM"), "zoom");
        assert_eq!(process_key(r"C:\Program Files\Zoom\bin\Zoom.EXE"), "zoom");
        assert_eq!(process_key("/usr/bin/obs"), "obs");
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{
            "processConfigs": {
                "cap.exe": { "processName": "cap.exe", "maxRuntimeSecs": 10, "actionType": "Terminate" }
            },
            "settings": { "enableAutoAction": false }
        }"#;
        let config: WatchConfig = serde_json::from_str(json).unwrap();
        let cap = &config.process_configs["cap.exe"];

        assert_eq!(cap.max_runtime, Duration::from_secs(10));
        assert_eq!(cap.action_type, ActionType::Terminate);
        assert!(cap.is_enabled);
        assert_eq!(cap.alert_before_action, 30);
        assert!(!config.settings.enable_auto_action);
        assert_eq!(config.settings.detector.registry_poll_interval_ms, 500);
        assert_eq!(config.settings.detector.full_scan_interval_secs, 5);
    }

    #[test]
    fn media_gating_uses_override_then_name_list() {
        let config = WatchConfig::empty();
        let zoom = ProcessConfig::new("zoom.exe");
        let cap = ProcessConfig::new("cap.exe");
        let forced = ProcessConfig {
            media_gated: Some(true),
            ..ProcessConfig::new("cap.exe")
        };

        assert!(config.is_media_gated(&zoom));
        assert!(!config.is_media_gated(&cap));
        assert!(config.is_media_gated(&forced));
    }

    #[test]
    fn find_enabled_skips_disabled_entries() {
        let config = WatchConfig::empty()
            .with_process(ProcessConfig::new("cap.exe"))
            .with_process(ProcessConfig {
                is_enabled: false,
                ..ProcessConfig::new("off.exe")
            });

        assert!(config.find_enabled("CAP").is_some());
        assert!(config.find_enabled("off.exe").is_none());
        assert_eq!(config.enabled().len(), 1);
    }

    #[test]
    fn load_writes_defaults_and_reload_picks_up_changes() {
        let path = temp_path("reload");
        let store = ConfigStore::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.current().process_configs.len(), 3);

        let updated = WatchConfig::empty().with_process(ProcessConfig::new("cap.exe"));
        fs::write(&path, serde_json::to_string(&updated).unwrap()).unwrap();
        // Force a different mtime even on coarse file systems
        *store.modified.lock() = Some(SystemTime::UNIX_EPOCH);

        assert!(store.reload_if_changed().unwrap());
        assert_eq!(store.current().process_configs.len(), 1);
        assert!(!store.reload_if_changed().unwrap());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn broken_file_keeps_previous_snapshot() {
        let path = temp_path("broken");
        let store = ConfigStore::load(&path).unwrap();
        fs::write(&path, "{ not json").unwrap();
        *store.modified.lock() = Some(SystemTime::UNIX_EPOCH);

        assert!(matches!(
            store.reload_if_changed(),
            Err(ConfigError::Parse { .. })
        ));
        assert_eq!(store.current().process_configs.len(), 3);
        assert!(!store.reload_if_changed().unwrap());

        let _ = fs::remove_file(&path);
    }
}
