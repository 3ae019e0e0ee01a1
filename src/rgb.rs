use crate::backend::{BackendError, RgbBackend, RgbColor, RgbDevice};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RgbTarget {
    Device(u32),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorCommand {
    pub color: RgbColor,
    /// Scale the color by the session brightness before sending.
    pub carry_brightness: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyFailure {
    pub index: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub sent: RgbColor,
    pub applied: Vec<u32>,
    pub failed: Vec<ApplyFailure>,
}

#[derive(Debug, Error)]
pub enum RgbError {
    #[error("lighting session is not connected")]
    NotConnected,
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,
    #[error("no lighting device with index {0} in the current session")]
    UnknownDevice(u32),
    #[error("lighting session was reset while the request was in flight")]
    Superseded,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RgbSnapshot {
    pub state: SessionState,
    pub devices: Vec<RgbDevice>,
    pub brightness_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

struct Session {
    state: SessionState,
    attempt: u64,
    devices: Vec<RgbDevice>,
    brightness: u8,
    last_failure: Option<String>,
}

pub struct RgbSession {
    backend: Arc<dyn RgbBackend>,
    session: RwLock<Session>,
}

impl RgbSession {
    pub fn new(backend: Arc<dyn RgbBackend>, brightness: u8) -> Self {
        Self {
            backend,
            session: RwLock::new(Session {
                state: SessionState::Disconnected,
                attempt: 0,
                devices: Vec::new(),
                brightness: brightness.min(100),
                last_failure: None,
            }),
        }
    }

    pub async fn snapshot(&self) -> RgbSnapshot {
        let s = self.session.read().await;
        RgbSnapshot {
            state: s.state,
            devices: s.devices.clone(),
            brightness_percent: s.brightness,
            last_failure: s.last_failure.clone(),
        }
    }

    pub async fn connect(&self) -> Result<ConnectOutcome, RgbError> {
        let attempt = {
            let mut s = self.session.write().await;
            match s.state {
                SessionState::Connected => return Ok(ConnectOutcome::AlreadyConnected),
                SessionState::Connecting => return Err(RgbError::ConnectInProgress),
                SessionState::Disconnected => {
                    s.state = SessionState::Connecting;
                    s.attempt += 1;
                    s.attempt
                }
            }
        };

        let result = self.backend.connect().await;

        let mut s = self.session.write().await;
        if s.attempt != attempt || s.state != SessionState::Connecting {
            debug!(attempt, current = s.attempt, "dropping superseded connect result");
            return Err(RgbError::Superseded);
        }
        match result {
            Ok(()) => {
                s.state = SessionState::Connected;
                s.last_failure = None;
                info!(attempt, "lighting session connected");
                Ok(ConnectOutcome::Connected)
            }
            Err(err) => {
                s.state = SessionState::Disconnected;
                s.last_failure = Some(err.to_string());
                warn!(error = %err, "lighting connect failed");
                Err(err.into())
            }
        }
    }

    /// Resets the session. In-flight results from the previous attempt are discarded.
    pub async fn disconnect(&self) {
        let mut s = self.session.write().await;
        s.attempt += 1;
        s.state = SessionState::Disconnected;
        s.devices.clear();
    }

    pub async fn scan(&self) -> Result<Vec<RgbDevice>, RgbError> {
        let attempt = self.connected_attempt().await?;
        let result = self.backend.scan_devices().await;

        let mut s = self.session.write().await;
        if s.attempt != attempt || s.state != SessionState::Connected {
            return Err(RgbError::Superseded);
        }
        match result {
            Ok(devices) => {
                info!(count = devices.len(), "lighting devices scanned");
                s.devices = devices;
                Ok(s.devices.clone())
            }
            Err(err) => {
                warn!(error = %err, "lighting scan failed");
                lose_connection_on(&mut s, &err);
                Err(err.into())
            }
        }
    }

    /// Sends one command per targeted device, in index order. A failing device is
    /// recorded in the report and the remaining devices are still attempted.
    pub async fn apply(
        &self,
        target: RgbTarget,
        command: ColorCommand,
    ) -> Result<ApplyReport, RgbError> {
        let (attempt, color, indices) = {
            let s = self.session.read().await;
            if s.state != SessionState::Connected {
                return Err(RgbError::NotConnected);
            }
            let color = if command.carry_brightness {
                command.color.scaled(s.brightness)
            } else {
                command.color
            };
            let indices: Vec<u32> = match target {
                RgbTarget::Device(index) => {
                    if !s.devices.iter().any(|d| d.index == index) {
                        return Err(RgbError::UnknownDevice(index));
                    }
                    vec![index]
                }
                RgbTarget::All => s.devices.iter().map(|d| d.index).collect(),
            };
            (s.attempt, color, indices)
        };

        let mut report = ApplyReport {
            sent: color,
            ..ApplyReport::default()
        };
        for index in indices {
            if self.session.read().await.attempt != attempt {
                return Err(RgbError::Superseded);
            }
            match self.backend.set_color(index, color).await {
                Ok(()) => report.applied.push(index),
                Err(err) => {
                    warn!(index, error = %err, "lighting update failed");
                    report.failed.push(ApplyFailure {
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Stores the local brightness percentage, clamped to 100. Nothing is sent.
    pub async fn set_brightness(&self, percent: u8) -> u8 {
        let mut s = self.session.write().await;
        s.brightness = percent.min(100);
        s.brightness
    }

    async fn connected_attempt(&self) -> Result<u64, RgbError> {
        let s = self.session.read().await;
        if s.state != SessionState::Connected {
            return Err(RgbError::NotConnected);
        }
        Ok(s.attempt)
    }
}

fn lose_connection_on(s: &mut Session, err: &BackendError) {
    if matches!(err, BackendError::NotConnected | BackendError::Io(_)) {
        s.state = SessionState::Disconnected;
        s.devices.clear();
        s.last_failure = Some(err.to_string());
    }
}
