use crate::backend::{BackendError, Device, DeviceBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceEffect {
    Disable,
    Enable,
}

impl DeviceEffect {
    pub fn enables(self) -> bool {
        matches!(self, Self::Enable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAction {
    pub target_device_id: String,
    pub target_label: String,
    pub is_critical: bool,
    pub requested_effect: DeviceEffect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Idle,
    PendingConfirmation { action: PendingAction },
    Dispatching { action: PendingAction },
}

impl GateState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PendingConfirmation { .. } => "pending_confirmation",
            Self::Dispatching { .. } => "dispatching",
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("cannot {operation} while the gate is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },
    #[error("command for device '{device_id}' failed: {source}")]
    Dispatch {
        device_id: String,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub device_id: String,
    pub effect: DeviceEffect,
}

/// Case-insensitive keyword match on the label users see.
pub fn classify_critical(label: &str, keywords: &[String]) -> bool {
    let label = label.to_lowercase();
    keywords
        .iter()
        .any(|k| label.contains(&k.trim().to_lowercase()))
}

/// Two-step confirmation in front of `toggle_device`. Only `confirm` reaches the backend.
pub struct SafetyGate {
    backend: Arc<dyn DeviceBackend>,
    critical_keywords: Vec<String>,
    state: RwLock<GateState>,
}

impl SafetyGate {
    pub fn new(backend: Arc<dyn DeviceBackend>, critical_keywords: Vec<String>) -> Self {
        Self {
            backend,
            critical_keywords,
            state: RwLock::new(GateState::Idle),
        }
    }

    pub async fn state(&self) -> GateState {
        self.state.read().await.clone()
    }

    /// Opens (or replaces) the pending action for `device`.
    pub async fn request(
        &self,
        device: &Device,
        effect: DeviceEffect,
    ) -> Result<PendingAction, GateError> {
        let mut state = self.state.write().await;
        if let GateState::Dispatching { .. } = &*state {
            return Err(GateError::InvalidTransition {
                operation: "request",
                state: state.name(),
            });
        }

        let label = device.display_name().to_string();
        let action = PendingAction {
            target_device_id: device.id.clone(),
            is_critical: classify_critical(&label, &self.critical_keywords),
            target_label: label,
            requested_effect: effect,
        };
        if let GateState::PendingConfirmation { action: previous } = &*state {
            info!(replaced = %previous.target_device_id, device = %action.target_device_id, "pending device action replaced");
        }
        *state = GateState::PendingConfirmation {
            action: action.clone(),
        };
        Ok(action)
    }

    /// Dispatches exactly one command for the pending action. The gate is back at Idle
    /// afterwards whatever the outcome.
    pub async fn confirm(&self) -> Result<DispatchReport, GateError> {
        let action = {
            let mut state = self.state.write().await;
            let GateState::PendingConfirmation { action } = &*state else {
                return Err(GateError::InvalidTransition {
                    operation: "confirm",
                    state: state.name(),
                });
            };
            let action = action.clone();
            *state = GateState::Dispatching {
                action: action.clone(),
            };
            action
        };

        let result = self
            .backend
            .toggle_device(&action.target_device_id, action.requested_effect.enables())
            .await;
        *self.state.write().await = GateState::Idle;

        match result {
            Ok(()) => {
                info!(
                    device = %action.target_device_id,
                    effect = ?action.requested_effect,
                    critical = action.is_critical,
                    "device command dispatched"
                );
                Ok(DispatchReport {
                    device_id: action.target_device_id,
                    effect: action.requested_effect,
                })
            }
            Err(source) => {
                warn!(device = %action.target_device_id, error = %source, "device command failed");
                Err(GateError::Dispatch {
                    device_id: action.target_device_id,
                    source,
                })
            }
        }
    }

    pub async fn cancel(&self) -> Result<PendingAction, GateError> {
        let mut state = self.state.write().await;
        let GateState::PendingConfirmation { action } = &*state else {
            return Err(GateError::InvalidTransition {
                operation: "cancel",
                state: state.name(),
            });
        };
        let action = action.clone();
        *state = GateState::Idle;
        Ok(action)
    }
}
