use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const ENV_DATA_DIR: &str = "ROOMSENSE_DATA_DIR";
pub const ENV_CLASSIFIER_ADDR: &str = "ROOMSENSE_CLASSIFIER_ADDR";
pub const ENV_DEBUG: &str = "ROOMSENSE_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Directory holding one `<hex>.sqlite3.db` file per family.
    pub data_dir: PathBuf,
    /// Capacity of each store's write queue. A full queue blocks submitters.
    pub queue_capacity: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub address: String,
    pub min_idle: usize,
    pub max_open: usize,
    pub retry_limit: u32,
    pub backoff_unit_ms: u64,
    pub report_interval_secs: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            address: "localhost:7005".into(),
            min_idle: 4,
            max_open: 8,
            retry_limit: 2,
            backoff_unit_ms: 1000,
            report_interval_secs: 10,
        }
    }
}

impl ClassifierSettings {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub interval_secs: u64,
    /// Minimum gap between the newest fingerprint and the last calibration.
    pub threshold_secs: u64,
    /// Calibration jobs allowed to run at once across all families.
    pub workers: usize,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            threshold_secs: 120,
            workers: 2,
        }
    }
}

impl CalibrationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub classifier: ClassifierSettings,
    pub calibration: CalibrationSettings,
    pub monitor_interval_secs: u64,
    pub debug: bool,
}

impl Settings {
    /// Read settings from a JSON file (missing file means defaults), then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings from {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("failed to parse settings in {}", path.display()))?
            }
            _ => Settings::default(),
        };

        if settings.monitor_interval_secs == 0 {
            settings.monitor_interval_secs = 10;
        }
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.trim().is_empty() {
                self.store.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(addr) = std::env::var(ENV_CLASSIFIER_ADDR) {
            if !addr.trim().is_empty() {
                self.classifier.address = addr;
            }
        }
        if let Ok(value) = std::env::var(ENV_DEBUG) {
            self.debug = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write settings to {}", path.display()))
    }
}
