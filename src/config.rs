use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, bail};
use serde_derive::Deserialize;

use crate::protocol::DEFAULT_THRESHOLD;

const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceEntry>,
    /// Default signal-strength threshold, e.g. "-50".
    pub rssi: Option<String>,
    /// Use `rssi` when a start request carries no threshold.
    pub use_config_rssi: Option<bool>,
    pub scan: Option<ScanConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

/// A `[[devices]]` table as written in the file.
#[derive(Deserialize, Debug, Clone)]
pub struct DeviceEntry {
    pub serial_path: String,
    pub device_id: Option<String>,
    pub baud_rate: Option<u32>,
    pub enabled: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub heartbeat_interval_ms: Option<u64>,
    pub reconnect_delay_seconds: Option<u64>,
    pub event_queue_capacity: Option<usize>,
    pub device_queue_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

/// Static parameters of one scanning module, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub serial_path: String,
    pub device_id: String,
    pub baud_rate: u32,
    pub enabled: bool,
    /// Threshold used when scanning starts without an explicit one.
    pub rssi: String,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.devices.is_empty() {
            bail!("no devices configured");
        }
        if let Some(index) = self
            .devices
            .iter()
            .position(|d| d.serial_path.trim().is_empty())
        {
            bail!("device {index} has an empty serial_path");
        }
        if !self.devices.iter().any(|d| d.enabled.unwrap_or(true)) {
            bail!("no enabled devices found");
        }
        Ok(())
    }

    pub fn rssi(&self) -> String {
        self.rssi
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_THRESHOLD)
            .to_string()
    }

    pub fn use_config_rssi(&self) -> bool {
        self.use_config_rssi.unwrap_or(false)
    }

    /// Every configured device, disabled ones included.
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        let rssi = self.rssi();
        self.devices
            .iter()
            .enumerate()
            .map(|(i, d)| DeviceConfig {
                serial_path: d.serial_path.clone(),
                device_id: d
                    .device_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("device_{i}")),
                baud_rate: d.baud_rate.filter(|b| *b > 0).unwrap_or(DEFAULT_BAUD_RATE),
                enabled: d.enabled.unwrap_or(true),
                rssi: rssi.clone(),
            })
            .collect()
    }

    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }

    pub fn log_level(&self) -> String {
        self.logging
            .as_ref()
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    }
}

impl ScanConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.unwrap_or(2000))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds.unwrap_or(5))
    }

    pub fn event_queue_capacity(&self) -> usize {
        self.event_queue_capacity.unwrap_or(1000)
    }

    pub fn device_queue_capacity(&self) -> usize {
        self.device_queue_capacity.unwrap_or(100)
    }
}
