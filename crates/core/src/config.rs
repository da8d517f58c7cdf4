//! Runtime settings shared by the HID daemon and the background service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Top-level settings document (JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub native: NativeSettings,
    pub shared_memory: SharedMemorySettings,
    pub ipc: IpcSettings,
    pub hotplug: HotplugSettings,
}

/// Native HID++ device manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeSettings {
    /// How often a fresh battery reading is wanted, in seconds.
    pub poll_period_secs: u64,
    /// Pause after every read attempt, in seconds.
    pub retry_time_secs: u64,
    /// Devices whose name contains any of these substrings are ignored.
    pub disabled_devices: Vec<String>,
}

impl Default for NativeSettings {
    fn default() -> Self {
        Self {
            poll_period_secs: 600,
            retry_time_secs: 10,
            disabled_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemorySettings {
    pub enabled: bool,
    /// Directory holding the region files. Defaults to `/dev/shm` when present.
    pub directory: Option<PathBuf>,
}

impl Default for SharedMemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

impl SharedMemorySettings {
    /// Directory the regions live in.
    pub fn region_dir(&self) -> PathBuf {
        if let Some(dir) = &self.directory {
            return dir.clone();
        }
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSettings {
    /// Unix socket the service listens on and the HID daemon connects to.
    pub socket_path: PathBuf,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("lgstray.sock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplugSettings {
    pub scan_interval_ms: u64,
}

impl Default for HotplugSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: 2000,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let settings = serde_json::from_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                debug!(path = %path.display(), "Settings loaded");
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config(format!("{}: {e}", path.display()))),
        }
    }
}

/// Timing of a device's polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Delay between the Init event and the first poll.
    pub settle: Duration,
    /// Desired interval between fresh readings.
    pub poll_period: Duration,
    /// Pause after every read attempt.
    pub retry_interval: Duration,
}

impl PollSchedule {
    pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
    /// Poll period used by debug builds.
    pub const DIAGNOSTIC_POLL_PERIOD: Duration = Duration::from_secs(1);

    pub fn from_settings(settings: &NativeSettings) -> Self {
        let poll_period = if cfg!(debug_assertions) {
            Self::DIAGNOSTIC_POLL_PERIOD
        } else {
            Duration::from_secs(settings.poll_period_secs)
        };
        Self {
            settle: Self::SETTLE_DELAY,
            poll_period,
            retry_interval: Duration::from_secs(settings.retry_time_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_native_manager() {
        let settings = Settings::default();
        assert_eq!(settings.native.poll_period_secs, 600);
        assert_eq!(settings.native.retry_time_secs, 10);
        assert!(settings.native.disabled_devices.is_empty());
        assert!(settings.shared_memory.enabled);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{ "native": { "disabled_devices": ["G915"] }, "shared_memory": { "enabled": false } }"#,
        )
        .unwrap();
        assert_eq!(settings.native.disabled_devices, vec!["G915".to_string()]);
        assert_eq!(settings.native.poll_period_secs, 600);
        assert!(!settings.shared_memory.enabled);
        assert_eq!(settings.hotplug.scan_interval_ms, 2000);
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn schedule_uses_retry_time() {
        let schedule = PollSchedule::from_settings(&NativeSettings {
            poll_period_secs: 300,
            retry_time_secs: 5,
            disabled_devices: vec![],
        });
        assert_eq!(schedule.settle, Duration::from_secs(1));
        assert_eq!(schedule.retry_interval, Duration::from_secs(5));
        if !cfg!(debug_assertions) {
            assert_eq!(schedule.poll_period, Duration::from_secs(300));
        }
    }
}
