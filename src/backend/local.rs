use crate::backend::{BackendError, Device, DeviceBackend, DriverBackend};
use async_trait::async_trait;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use sysinfo::{ProcessExt, ProcessRefreshKind, RefreshKind, System, SystemExt};
use tokio::process::Command;
use tokio::task;
use tracing::{debug, info};

const USB_SYSFS_ROOT: &str = "/sys/bus/usb/devices";

/// Hardware access for the machine the daemon runs on: USB peripherals through sysfs,
/// driver processes through the process table.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    usb_root: PathBuf,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_usb_root(USB_SYSFS_ROOT)
    }

    pub fn with_usb_root(path: impl Into<PathBuf>) -> Self {
        Self {
            usb_root: path.into(),
        }
    }
}

#[async_trait]
impl DeviceBackend for LocalBackend {
    async fn get_devices(&self) -> Result<Vec<Device>, BackendError> {
        let root = self.usb_root.clone();
        task::spawn_blocking(move || read_usb_devices(&root))
            .await
            .map_err(|err| BackendError::Request(format!("device scan task failed: {err}")))?
    }

    async fn toggle_device(&self, id: &str, enable: bool) -> Result<(), BackendError> {
        if is_protected(id) {
            return Err(BackendError::Denied(id.to_string()));
        }
        if !self.usb_root.is_dir() {
            return Err(BackendError::Unsupported("usb sysfs is not available"));
        }

        let attr = self.usb_root.join(id).join("authorized");
        let value = if enable { "1" } else { "0" };
        match tokio::fs::write(&attr, value).await {
            Ok(()) => {
                info!(device = %id, enable, "device authorization changed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::Request(format!("unknown device '{id}'")))
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => Err(
                BackendError::Request(format!("permission denied writing {}", attr.display())),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn local_ip(&self) -> Result<IpAddr, BackendError> {
        local_ip_address::local_ip().map_err(|err| BackendError::Request(err.to_string()))
    }
}

#[async_trait]
impl DriverBackend for LocalBackend {
    async fn check_driver_status(&self, name: &str) -> Result<bool, BackendError> {
        let needle = name.to_lowercase();
        task::spawn_blocking(move || {
            let mut system = System::new_with_specifics(
                RefreshKind::new().with_processes(ProcessRefreshKind::new()),
            );
            system.refresh_processes();
            system
                .processes()
                .values()
                .any(|process| process.name().to_lowercase().contains(&needle))
        })
        .await
        .map_err(|err| BackendError::Request(format!("process scan task failed: {err}")))
    }

    async fn launch_driver(&self, path: &str) -> Result<(), BackendError> {
        let child = Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        info!(path = %path, pid = ?child.id(), "driver launched");
        Ok(())
    }
}

/// Backend-side refusal list. The confirmation step in the UI is advisory; this is final.
pub fn is_protected(id: &str) -> bool {
    let lower = id.to_lowercase();
    lower.contains("root")
        || lower.contains("system")
        || lower.starts_with("usb")
        || lower.contains('/')
        || lower.contains("..")
        || lower.is_empty()
}

fn read_usb_devices(root: &Path) -> Result<Vec<Device>, BackendError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(root = %root.display(), "usb sysfs not present, reporting no devices");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };

    let mut devices = Vec::new();
    for entry in entries.flatten() {
        let id = entry.file_name().to_string_lossy().to_string();
        // interface nodes look like "1-1:1.0"
        if id.contains(':') {
            continue;
        }
        let dir = entry.path();
        let vendor = read_attr(&dir, "idVendor");
        let product_id = read_attr(&dir, "idProduct");
        let name = match (read_attr(&dir, "product"), &vendor, &product_id) {
            (Some(product), _, _) => product,
            (None, Some(v), Some(p)) => format!("USB device {v}:{p}"),
            _ => continue,
        };

        let class_code = match read_attr(&dir, "bDeviceClass").as_deref() {
            Some("00") | None => read_attr(&dir.join(format!("{id}:1.0")), "bInterfaceClass"),
            Some(code) => Some(code.to_string()),
        };

        devices.push(Device::new(
            id,
            name,
            usb_class_name(class_code.as_deref().unwrap_or("")),
        ));
    }

    devices.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(devices)
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn usb_class_name(code: &str) -> &'static str {
    match code.to_lowercase().as_str() {
        "01" => "Audio",
        "02" => "Communications",
        "03" => "HID",
        "06" => "Image",
        "07" => "Printer",
        "08" => "Mass Storage",
        "09" => "Hub",
        "0a" => "CDC Data",
        "0e" => "Video",
        "e0" => "Wireless",
        "ef" => "Miscellaneous",
        "ff" => "Vendor Specific",
        _ => "Generic",
    }
}
