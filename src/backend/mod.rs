pub mod local;
pub mod openrgb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("device '{0}' is protected and cannot be toggled")]
    Denied(String),
    #[error("lighting backend is not connected")]
    NotConnected,
    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),
    #[error("io error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// A peripheral as reported by the hardware backend, merged with its alias entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class: class.into(),
            alias: None,
            icon: None,
        }
    }

    /// The user-assigned alias when present, the backend name otherwise.
    pub fn display_name(&self) -> &str {
        match self.alias.as_deref() {
            Some(alias) if !alias.trim().is_empty() => alias,
            _ => &self.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbDevice {
    pub name: String,
    pub index: u32,
    pub led_count: usize,
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Builds a color from unchecked channel values, clamping each into 0..=255.
    pub fn clamped(r: i64, g: i64, b: i64) -> Self {
        let clamp = |v: i64| v.clamp(0, 255) as u8;
        Self {
            r: clamp(r),
            g: clamp(g),
            b: clamp(b),
        }
    }

    pub fn scaled(self, percent: u8) -> Self {
        let pct = u16::from(percent.min(100));
        let scale = |v: u8| ((u16::from(v) * pct + 50) / 100) as u8;
        Self {
            r: scale(self.r),
            g: scale(self.g),
            b: scale(self.b),
        }
    }
}

#[async_trait]
pub trait DeviceBackend: Send + Sync {
    async fn get_devices(&self) -> Result<Vec<Device>, BackendError>;
    async fn toggle_device(&self, id: &str, enable: bool) -> Result<(), BackendError>;
    async fn local_ip(&self) -> Result<IpAddr, BackendError>;
}

#[async_trait]
pub trait DriverBackend: Send + Sync {
    async fn check_driver_status(&self, name: &str) -> Result<bool, BackendError>;
    async fn launch_driver(&self, path: &str) -> Result<(), BackendError>;
}

#[async_trait]
pub trait RgbBackend: Send + Sync {
    async fn connect(&self) -> Result<(), BackendError>;
    async fn scan_devices(&self) -> Result<Vec<RgbDevice>, BackendError>;
    async fn set_color(&self, index: u32, color: RgbColor) -> Result<(), BackendError>;
}
