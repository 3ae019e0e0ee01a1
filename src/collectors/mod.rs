pub mod sensors;
pub mod system;

use crate::metrics::Metrics;
use crate::telemetry::{now_unix_ms, TelemetryEvent, TelemetryPayload};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Latest environment values from the sensor broker. Zero until the first message.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnvReadings {
    pub temperature: f64,
    pub humidity: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_load_percent: f64,
    pub memory_load_percent: f64,
    pub net_up_bytes_per_sec: u64,
    pub net_down_bytes_per_sec: u64,
}

pub fn build_payload(
    system: &SystemSnapshot,
    env: &EnvReadings,
    captured_at_unix_ms: i64,
) -> TelemetryPayload {
    TelemetryPayload {
        temperature: env.temperature,
        humidity: env.humidity,
        power: env.power,
        cpu_load: system.cpu_load_percent,
        memory_load: system.memory_load_percent,
        net_up_bytes_per_sec: system.net_up_bytes_per_sec,
        net_down_bytes_per_sec: system.net_down_bytes_per_sec,
        captured_at_unix_ms: Some(captured_at_unix_ms),
    }
}

/// Samples the host every `interval`, merges the latest environment readings and pushes
/// an `iot-data` event into the ingest channel.
pub async fn run_collector(
    interval: Duration,
    env: watch::Receiver<EnvReadings>,
    events: mpsc::Sender<TelemetryEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut system = System::new_all();
    let mut last_refresh = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("telemetry collector stopping");
                break;
            }
            _ = ticker.tick() => {
                let elapsed = last_refresh.elapsed();
                last_refresh = Instant::now();
                let snapshot = system::collect_system(&mut system, elapsed);
                let readings = *env.borrow();
                let payload = build_payload(&snapshot, &readings, now_unix_ms());

                let event = match TelemetryEvent::telemetry(&payload) {
                    Ok(event) => event,
                    Err(err) => {
                        metrics.inc_backend_failure("collect");
                        warn!(error = %err, "failed to encode telemetry payload");
                        continue;
                    }
                };
                if events.send(event).await.is_err() {
                    info!("telemetry ingest closed, collector stopping");
                    break;
                }
            }
        }
    }
}
