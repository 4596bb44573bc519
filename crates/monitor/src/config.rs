//! Monitor configuration management

use crate::usb::filter::DeviceFilter;
use crate::usb::identity::KeyOptions;
use crate::usb::monitor::{DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_TIMEOUT, MonitorSettings};
use crate::usb::reconcile::{DEFAULT_CHECK_INTERVAL, DEFAULT_FIRST_CHECK_DELAY};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "MonitorSection::default_log_level")]
    pub log_level: String,
    /// Delay before the first reconciliation pass after register
    #[serde(default = "MonitorSection::default_first_check_delay", with = "duration_serde")]
    pub first_check_delay: Duration,
    /// Period of the reconciliation loop
    #[serde(default = "MonitorSection::default_check_interval", with = "duration_serde")]
    pub check_interval: Duration,
    /// Capacity of the worker task queue
    #[serde(default = "MonitorSection::default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long destroy waits for the worker to finish
    #[serde(default = "MonitorSection::default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            first_check_delay: Self::default_first_check_delay(),
            check_interval: Self::default_check_interval(),
            queue_capacity: Self::default_queue_capacity(),
            shutdown_timeout: Self::default_shutdown_timeout(),
        }
    }
}

impl MonitorSection {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_first_check_delay() -> Duration {
        DEFAULT_FIRST_CHECK_DELAY
    }

    fn default_check_interval() -> Duration {
        DEFAULT_CHECK_INTERVAL
    }

    fn default_queue_capacity() -> usize {
        DEFAULT_QUEUE_CAPACITY
    }

    fn default_shutdown_timeout() -> Duration {
        DEFAULT_SHUTDOWN_TIMEOUT
    }
}

/// Device selection and identity settings
///
/// # Example Configuration
/// ```toml
/// [usb]
/// filters = ["!0x1d6b:*", "0x04f9:*"]  # skip root hubs, then Brother devices
/// auto_request_permission = true
///
/// [usb.identity]
/// with_serial = true
/// extended = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Textual filters, first match wins (see [`DeviceFilter`])
    #[serde(default)]
    pub filters: Vec<String>,
    /// Prompt for permission as soon as a device attaches
    #[serde(default = "UsbSettings::default_auto_request")]
    pub auto_request_permission: bool,
    #[serde(default)]
    pub identity: KeyOptions,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            auto_request_permission: Self::default_auto_request(),
            identity: KeyOptions::default(),
        }
    }
}

impl UsbSettings {
    fn default_auto_request() -> bool {
        true
    }
}

/// Custom serde module for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "500ms", "2s", "1m30s"
    ///
    /// A bare number is taken as seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total = Duration::ZERO;
        let mut chars = s.chars().peekable();

        while chars.peek().is_some() {
            let mut num = String::new();
            while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
                num.push(c);
                chars.next();
            }
            let mut unit = String::new();
            while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
                unit.push(c);
                chars.next();
            }

            if num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let value: u64 = num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", num))?;

            total += match unit.as_str() {
                "h" => Duration::from_secs(value * 3600),
                "m" => Duration::from_secs(value * 60),
                "s" | "" => Duration::from_secs(value),
                "ms" => Duration::from_millis(value),
                _ => return Err(format!("Invalid duration unit: {}", unit)),
            };
        }

        Ok(total)
    }

    pub fn format_duration(d: Duration) -> String {
        let millis = d.subsec_millis();
        let secs = d.as_secs();
        if secs == 0 && millis > 0 {
            return format!("{}ms", millis);
        }

        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        if millis > 0 {
            result.push_str(&format!("{}ms", millis));
        }
        result
    }
}

pub use duration_serde::{format_duration, parse_duration};

impl MonitorConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path the user config and then `/etc/usb-monitor/monitor.toml`
    /// are tried.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = [
                Self::default_path(),
                PathBuf::from("/etc/usb-monitor/monitor.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: MonitorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-monitor").join("monitor.toml")
        } else {
            PathBuf::from(".config/usb-monitor/monitor.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.monitor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.monitor.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.monitor.check_interval.is_zero() {
            return Err(anyhow!("check_interval must be greater than 0"));
        }
        if self.monitor.first_check_delay.is_zero() {
            return Err(anyhow!("first_check_delay must be greater than 0"));
        }
        if self.monitor.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be greater than 0"));
        }

        self.filters()?;
        Ok(())
    }

    /// Parse the textual filters in order
    pub fn filters(&self) -> Result<Vec<DeviceFilter>> {
        self.usb
            .filters
            .iter()
            .map(|f| f.parse::<DeviceFilter>().map_err(|e| anyhow!(e)))
            .collect()
    }

    /// Settings for [`Monitor::new`](crate::usb::Monitor::new)
    pub fn to_settings(&self) -> Result<MonitorSettings> {
        Ok(MonitorSettings {
            filters: self.filters()?,
            key_options: self.usb.identity,
            first_check_delay: self.monitor.first_check_delay,
            check_interval: self.monitor.check_interval,
            queue_capacity: self.monitor.queue_capacity,
            shutdown_timeout: self.monitor.shutdown_timeout,
        })
    }
}

/// Load a config from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<MonitorConfig> {
    let path_buf = expand_path(path);
    MonitorConfig::load(Some(path_buf))
}

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.monitor.log_level, "info");
        assert_eq!(config.monitor.first_check_delay, Duration::from_secs(1));
        assert_eq!(config.monitor.check_interval, Duration::from_secs(2));
        assert_eq!(config.monitor.queue_capacity, 256);
        assert!(config.usb.auto_request_permission);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_config_serialization() {
        let mut config = MonitorConfig::default();
        config.usb.filters = vec!["0x1234:*".to_string()];
        config.monitor.check_interval = Duration::from_millis(750);

        let toml_str = toml::to_string(&config).unwrap();
        let parsed = MonitorConfig::from_toml(&toml_str).unwrap();

        assert_eq!(parsed.usb.filters, config.usb.filters);
        assert_eq!(parsed.monitor.check_interval, Duration::from_millis(750));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MonitorConfig::default();
        config.monitor.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.monitor.check_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.monitor.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.usb.filters = vec!["1234:5678".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_settings() {
        let mut config = MonitorConfig::default();
        config.usb.filters = vec!["!0x1d6b:*".to_string(), "*:*".to_string()];
        config.usb.identity.with_serial = true;

        let settings = config.to_settings().unwrap();

        assert_eq!(settings.filters.len(), 2);
        assert!(settings.filters[0].exclude);
        assert!(settings.key_options.with_serial);
    }
}
