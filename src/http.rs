use crate::backend::{BackendError, Device, DeviceBackend, RgbColor, RgbDevice};
use crate::drivers::{DriverError, DriverInfo, DriverPoller};
use crate::metrics::Metrics;
use crate::rgb::{ApplyReport, ColorCommand, RgbError, RgbSession, RgbSnapshot, RgbTarget};
use crate::safety::{DeviceEffect, DispatchReport, GateError, GateState, PendingAction, SafetyGate};
use crate::telemetry::{
    format_bytes, SampleSeverity, Severity, SharedTelemetry, TelemetrySample,
};
use crate::topology::{RefreshOutcome, TopologyGraph, TopologyService};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub telemetry: SharedTelemetry,
    pub live: broadcast::Sender<TelemetrySample>,
    pub topology: Arc<TopologyService>,
    pub gate: Arc<SafetyGate>,
    pub rgb: Arc<RgbSession>,
    pub drivers: Arc<DriverPoller>,
    pub devices: Arc<dyn DeviceBackend>,
    pub listen_port: u16,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::InvalidTransition { .. } => Self::Conflict(err.to_string()),
            GateError::Dispatch { .. } => Self::Upstream(err.to_string()),
        }
    }
}

impl From<RgbError> for ApiError {
    fn from(err: RgbError) -> Self {
        match err {
            RgbError::NotConnected | RgbError::ConnectInProgress | RgbError::Superseded => {
                Self::Conflict(err.to_string())
            }
            RgbError::UnknownDevice(_) => Self::NotFound(err.to_string()),
            RgbError::Backend(_) => Self::Upstream(err.to_string()),
        }
    }
}

impl From<DriverError> for ApiError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::UnknownPath(_) => Self::NotFound(err.to_string()),
            DriverError::Launch(_) => Self::Upstream(err.to_string()),
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        Self::BadRequest(err.body_text())
    }
}

#[derive(Debug, Serialize)]
pub struct LatestTelemetry {
    pub sample: Option<TelemetrySample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<SampleSeverity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_up: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_down: Option<String>,
}

impl From<Option<TelemetrySample>> for LatestTelemetry {
    fn from(sample: Option<TelemetrySample>) -> Self {
        let severity = sample.as_ref().map(SampleSeverity::for_sample);
        Self {
            severity,
            worst: severity.map(|s| s.worst()),
            net_up: sample.as_ref().map(|s| format_bytes(s.net_up_bytes_per_sec)),
            net_down: sample
                .as_ref()
                .map(|s| format_bytes(s.net_down_bytes_per_sec)),
            sample,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enable: bool,
}

#[derive(Debug, Deserialize)]
struct ColorRequest {
    /// Device index; absent means every known device.
    #[serde(default)]
    index: Option<u32>,
    r: i64,
    g: i64,
    b: i64,
    #[serde(default)]
    carry_brightness: bool,
}

#[derive(Debug, Deserialize)]
struct BrightnessRequest {
    percent: i64,
}

#[derive(Debug, Serialize)]
struct BrightnessResponse {
    percent: u8,
}

#[derive(Debug, Deserialize)]
struct LaunchRequest {
    path: String,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    stale: bool,
    changed: bool,
    devices: usize,
}

#[derive(Debug, Serialize)]
struct PairingInfo {
    ip: String,
    bridge_url: String,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/telemetry/latest", get(latest_handler))
        .route("/api/telemetry/history", get(history_handler))
        .route("/ws/telemetry", get(ws_telemetry))
        .route("/api/topology", get(topology_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/refresh", post(refresh_handler))
        .route("/api/devices/:id/toggle", post(toggle_handler))
        .route("/api/safety", get(safety_handler))
        .route("/api/safety/confirm", post(confirm_handler))
        .route("/api/safety/cancel", post(cancel_handler))
        .route("/api/rgb", get(rgb_handler))
        .route("/api/rgb/connect", post(rgb_connect_handler))
        .route("/api/rgb/disconnect", post(rgb_disconnect_handler))
        .route("/api/rgb/scan", post(rgb_scan_handler))
        .route("/api/rgb/color", post(rgb_color_handler))
        .route("/api/rgb/brightness", put(rgb_brightness_handler))
        .route("/api/drivers", get(drivers_handler))
        .route("/api/drivers/launch", post(launch_handler))
        .route("/api/pairing", get(pairing_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn latest_handler(State(state): State<HttpAppState>) -> Json<LatestTelemetry> {
    let latest = state.telemetry.read().await.latest();
    Json(latest.into())
}

async fn history_handler(State(state): State<HttpAppState>) -> Json<Vec<TelemetrySample>> {
    Json(state.telemetry.read().await.history())
}

async fn ws_telemetry(ws: WebSocketUpgrade, State(state): State<HttpAppState>) -> Response {
    let samples = state.live.subscribe();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| stream_samples(socket, samples, shutdown))
}

async fn stream_samples(
    mut socket: WebSocket,
    mut samples: broadcast::Receiver<TelemetrySample>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = samples.recv() => received,
        };
        match received {
            Ok(sample) => {
                let text = match serde_json::to_string(&sample) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode telemetry sample");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    debug!("telemetry websocket client went away");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "telemetry websocket lagging, skipping samples");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn topology_handler(State(state): State<HttpAppState>) -> Json<TopologyGraph> {
    Json(state.topology.graph().await)
}

async fn devices_handler(State(state): State<HttpAppState>) -> Json<Vec<Device>> {
    Json(state.topology.devices().await)
}

async fn refresh_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let outcome = state.topology.refresh_devices().await.map_err(|err| {
        state.metrics.inc_backend_failure("get_devices");
        ApiError::from(err)
    })?;
    let response = match outcome {
        RefreshOutcome::Applied { changed, devices } => {
            if changed {
                state.metrics.record_rebuild(&state.topology.graph().await);
            }
            RefreshResponse {
                stale: false,
                changed,
                devices,
            }
        }
        RefreshOutcome::Stale => RefreshResponse {
            stale: true,
            changed: false,
            devices: 0,
        },
    };
    Ok(Json(response))
}

async fn toggle_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
    body: Result<Json<ToggleRequest>, JsonRejection>,
) -> Result<Json<PendingAction>, ApiError> {
    let Json(request) = body?;
    let device = state
        .topology
        .device(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown device '{id}'")))?;
    let effect = if request.enable {
        DeviceEffect::Enable
    } else {
        DeviceEffect::Disable
    };
    Ok(Json(state.gate.request(&device, effect).await?))
}

async fn safety_handler(State(state): State<HttpAppState>) -> Json<GateState> {
    Json(state.gate.state().await)
}

async fn confirm_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<DispatchReport>, ApiError> {
    match state.gate.confirm().await {
        Ok(report) => {
            state.metrics.inc_safety_dispatch("ok");
            if let Err(err) = state.topology.refresh_devices().await {
                state.metrics.inc_backend_failure("get_devices");
                warn!(error = %err, "device refresh after dispatch failed");
            }
            Ok(Json(report))
        }
        Err(err) => {
            let outcome = match err {
                GateError::InvalidTransition { .. } => "rejected",
                GateError::Dispatch { .. } => {
                    state.metrics.inc_backend_failure("toggle_device");
                    "failed"
                }
            };
            state.metrics.inc_safety_dispatch(outcome);
            Err(err.into())
        }
    }
}

async fn cancel_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<PendingAction>, ApiError> {
    Ok(Json(state.gate.cancel().await?))
}

async fn rgb_handler(State(state): State<HttpAppState>) -> Json<RgbSnapshot> {
    Json(state.rgb.snapshot().await)
}

async fn rgb_connect_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<RgbSnapshot>, ApiError> {
    state.rgb.connect().await.map_err(|err| {
        if matches!(err, RgbError::Backend(_)) {
            state.metrics.inc_backend_failure("connect_rgb");
        }
        ApiError::from(err)
    })?;
    state.rgb.scan().await.map_err(|err| {
        if matches!(err, RgbError::Backend(_)) {
            state.metrics.inc_backend_failure("scan_rgb_devices");
        }
        ApiError::from(err)
    })?;
    Ok(Json(state.rgb.snapshot().await))
}

async fn rgb_disconnect_handler(State(state): State<HttpAppState>) -> Json<RgbSnapshot> {
    state.rgb.disconnect().await;
    Json(state.rgb.snapshot().await)
}

async fn rgb_scan_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<Vec<RgbDevice>>, ApiError> {
    let devices = state.rgb.scan().await.map_err(|err| {
        if matches!(err, RgbError::Backend(_)) {
            state.metrics.inc_backend_failure("scan_rgb_devices");
        }
        ApiError::from(err)
    })?;
    Ok(Json(devices))
}

async fn rgb_color_handler(
    State(state): State<HttpAppState>,
    body: Result<Json<ColorRequest>, JsonRejection>,
) -> Result<Json<ApplyReport>, ApiError> {
    let Json(request) = body?;
    let target = match request.index {
        Some(index) => RgbTarget::Device(index),
        None => RgbTarget::All,
    };
    let command = ColorCommand {
        color: RgbColor::clamped(request.r, request.g, request.b),
        carry_brightness: request.carry_brightness,
    };

    let report = state.rgb.apply(target, command).await?;
    for _ in &report.applied {
        state.metrics.inc_rgb_command("ok");
    }
    for _ in &report.failed {
        state.metrics.inc_rgb_command("failed");
        state.metrics.inc_backend_failure("set_rgb_color");
    }

    if let (RgbTarget::Device(_), Some(failure)) = (target, report.failed.first()) {
        return Err(ApiError::Upstream(failure.error.clone()));
    }
    Ok(Json(report))
}

async fn rgb_brightness_handler(
    State(state): State<HttpAppState>,
    body: Result<Json<BrightnessRequest>, JsonRejection>,
) -> Result<Json<BrightnessResponse>, ApiError> {
    let Json(request) = body?;
    let percent = request.percent.clamp(0, 100) as u8;
    Ok(Json(BrightnessResponse {
        percent: state.rgb.set_brightness(percent).await,
    }))
}

async fn drivers_handler(State(state): State<HttpAppState>) -> Json<Vec<DriverInfo>> {
    Json(state.drivers.drivers().await)
}

async fn launch_handler(
    State(state): State<HttpAppState>,
    body: Result<Json<LaunchRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = body?;
    state.drivers.launch(&request.path).await.map_err(|err| {
        if matches!(err, DriverError::Launch(_)) {
            state.metrics.inc_backend_failure("launch_driver");
        }
        ApiError::from(err)
    })?;
    Ok(StatusCode::ACCEPTED)
}

async fn pairing_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<PairingInfo>, ApiError> {
    let ip = state.devices.local_ip().await.map_err(|err| {
        state.metrics.inc_backend_failure("local_ip");
        ApiError::from(err)
    })?;
    Ok(Json(PairingInfo {
        ip: ip.to_string(),
        bridge_url: format!("http://{ip}:{}", state.listen_port),
    }))
}
