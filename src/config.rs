use crate::topology::{Layout, LoadMetric};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub drivers: DriversConfig,
    #[serde(default)]
    pub rgb: RgbConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

/// MQTT source for the environment readings (temperature, humidity, power).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorsConfig {
    #[serde(default = "default_sensors_enabled")]
    pub enabled: bool,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default = "default_temperature_topic")]
    pub temperature_topic: String,
    #[serde(default = "default_humidity_topic")]
    pub humidity_topic: String,
    #[serde(default = "default_power_topic")]
    pub power_topic: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyConfig {
    #[serde(default = "default_port_capacity")]
    pub port_capacity: usize,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub bound_metric: LoadMetric,
    #[serde(default = "default_idle_load")]
    pub idle_load: f64,
    /// Rate that counts as a fully loaded link when a network metric is bound.
    #[serde(default = "default_net_saturation_bytes_per_sec")]
    pub net_saturation_bytes_per_sec: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DevicesConfig {
    #[serde(default = "default_device_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub alias_file: Option<String>,
    #[serde(default)]
    pub usb_sysfs_root: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriversConfig {
    #[serde(default = "default_driver_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub registry: Vec<DriverEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DriverEntry {
    pub name: String,
    pub launch_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RgbConfig {
    #[serde(default = "default_rgb_host")]
    pub host: String,
    #[serde(default = "default_rgb_port")]
    pub port: u16,
    #[serde(default = "default_rgb_client_name")]
    pub client_name: String,
    #[serde(default = "default_brightness_percent")]
    pub brightness_percent: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyConfig {
    #[serde(default = "default_critical_keywords")]
    pub critical_keywords: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_telemetry_interval_secs(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            enabled: default_sensors_enabled(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            client_id: default_mqtt_client_id(),
            temperature_topic: default_temperature_topic(),
            humidity_topic: default_humidity_topic(),
            power_topic: default_power_topic(),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            port_capacity: default_port_capacity(),
            layout: Layout::default(),
            bound_metric: LoadMetric::default(),
            idle_load: default_idle_load(),
            net_saturation_bytes_per_sec: default_net_saturation_bytes_per_sec(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_device_refresh_interval_secs(),
            alias_file: None,
            usb_sysfs_root: None,
        }
    }
}

impl Default for DriversConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_driver_poll_interval_secs(),
            registry: Vec::new(),
        }
    }
}

impl Default for RgbConfig {
    fn default() -> Self {
        Self {
            host: default_rgb_host(),
            port: default_rgb_port(),
            client_name: default_rgb_client_name(),
            brightness_percent: default_brightness_percent(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            critical_keywords: default_critical_keywords(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.telemetry.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "telemetry.interval_secs must be >= 1".to_string(),
            ));
        }
        if self.telemetry.history_capacity < 1 {
            return Err(ConfigError::Validation(
                "telemetry.history_capacity must be >= 1".to_string(),
            ));
        }

        validate_sensors(&self.sensors)?;
        validate_topology(&self.topology)?;
        validate_drivers(&self.drivers)?;

        if self.devices.refresh_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "devices.refresh_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.rgb.host.trim().is_empty() || self.rgb.port == 0 {
            return Err(ConfigError::Validation(
                "rgb.host must not be empty and rgb.port must be in 1..65535".to_string(),
            ));
        }
        if self.rgb.brightness_percent > 100 {
            return Err(ConfigError::Validation(
                "rgb.brightness_percent must be in 0..100".to_string(),
            ));
        }
        if self
            .safety
            .critical_keywords
            .iter()
            .any(|k| k.trim().is_empty())
        {
            return Err(ConfigError::Validation(
                "safety.critical_keywords must not contain empty entries".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_sensors(cfg: &SensorsConfig) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if cfg.broker_host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "sensors.broker_host must not be empty".to_string(),
        ));
    }
    if cfg.broker_port == 0 {
        return Err(ConfigError::Validation(
            "sensors.broker_port must be in 1..65535".to_string(),
        ));
    }
    let topics = [&cfg.temperature_topic, &cfg.humidity_topic, &cfg.power_topic];
    if topics.iter().any(|t| t.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "sensors topics must not be empty".to_string(),
        ));
    }
    let unique: HashSet<&str> = topics.iter().map(|t| t.as_str()).collect();
    if unique.len() != topics.len() {
        return Err(ConfigError::Validation(
            "sensors topics must be distinct".to_string(),
        ));
    }
    Ok(())
}

fn validate_topology(cfg: &TopologyConfig) -> Result<(), ConfigError> {
    if cfg.port_capacity < 1 {
        return Err(ConfigError::Validation(
            "topology.port_capacity must be >= 1".to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&cfg.idle_load) {
        return Err(ConfigError::Validation(
            "topology.idle_load must be in 0..100".to_string(),
        ));
    }
    if cfg.net_saturation_bytes_per_sec == 0 {
        return Err(ConfigError::Validation(
            "topology.net_saturation_bytes_per_sec must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_drivers(cfg: &DriversConfig) -> Result<(), ConfigError> {
    if cfg.poll_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "drivers.poll_interval_secs must be >= 1".to_string(),
        ));
    }
    let mut names = HashSet::new();
    for entry in &cfg.registry {
        if entry.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "drivers.registry[*].name must not be empty".to_string(),
            ));
        }
        if !names.insert(entry.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "driver name '{}' must be unique",
                entry.name
            )));
        }
        if entry.launch_path.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "driver '{}' launch_path must not be empty",
                entry.name
            )));
        }
    }
    Ok(())
}

const fn default_telemetry_interval_secs() -> u64 {
    2
}

const fn default_history_capacity() -> usize {
    crate::telemetry::HISTORY_CAPACITY
}

const fn default_sensors_enabled() -> bool {
    true
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

const fn default_broker_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "aether-core".to_string()
}

fn default_temperature_topic() -> String {
    "sensor/temp".to_string()
}

fn default_humidity_topic() -> String {
    "sensor/humidity".to_string()
}

fn default_power_topic() -> String {
    "sensor/power".to_string()
}

const fn default_port_capacity() -> usize {
    4
}

const fn default_idle_load() -> f64 {
    10.0
}

const fn default_net_saturation_bytes_per_sec() -> u64 {
    12_500_000
}

const fn default_device_refresh_interval_secs() -> u64 {
    10
}

const fn default_driver_poll_interval_secs() -> u64 {
    5
}

fn default_rgb_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_rgb_port() -> u16 {
    6742
}

fn default_rgb_client_name() -> String {
    "Aether".to_string()
}

const fn default_brightness_percent() -> u8 {
    100
}

fn default_critical_keywords() -> Vec<String> {
    ["mouse", "keyboard", "system"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        serde_yaml::from_str("listen: \"127.0.0.1:9110\"\n").expect("minimal config")
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = valid_config();
        cfg.validate().expect("defaults must validate");
        assert_eq!(cfg.telemetry.interval_secs, 2);
        assert_eq!(cfg.telemetry.history_capacity, 50);
        assert_eq!(cfg.topology.port_capacity, 4);
        assert_eq!(cfg.topology.layout, Layout::Arc);
        assert_eq!(cfg.topology.bound_metric, LoadMetric::CpuLoad);
        assert_eq!(cfg.drivers.poll_interval_secs, 5);
        assert_eq!(cfg.rgb.port, 6742);
        assert_eq!(
            cfg.safety.critical_keywords,
            vec!["mouse", "keyboard", "system"]
        );
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example validates");
        assert!(!cfg.drivers.registry.is_empty());
        assert_eq!(cfg.topology.layout, Layout::Column);
    }

    #[test]
    fn duplicate_driver_names_are_rejected() {
        let mut cfg = valid_config();
        let entry = DriverEntry {
            name: "openrgb".to_string(),
            launch_path: "/usr/bin/openrgb".to_string(),
        };
        cfg.drivers.registry = vec![entry.clone(), entry];
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn zero_port_capacity_is_rejected() {
        let mut cfg = valid_config();
        cfg.topology.port_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn disabled_sensors_skip_broker_checks() {
        let mut cfg = valid_config();
        cfg.sensors.broker_host = String::new();
        assert!(cfg.validate().is_err());
        cfg.sensors.enabled = false;
        cfg.validate().expect("disabled sensors are not validated");
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let mut cfg = valid_config();
        cfg.listen = "not-an-address".to_string();
        assert!(cfg.validate().is_err());
    }
}
