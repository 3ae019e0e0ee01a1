use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

pub const HISTORY_CAPACITY: usize = 50;
pub const TELEMETRY_EVENT: &str = "iot-data";

pub type SharedTelemetry = Arc<RwLock<TelemetryStore>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub temperature: f64,
    pub humidity: f64,
    pub power: f64,
    pub cpu_load: f64,
    pub memory_load: f64,
    pub net_up_bytes_per_sec: u64,
    pub net_down_bytes_per_sec: u64,
    pub captured_at_unix_ms: i64,
}

/// Wire shape of an `iot-data` event as pushed by the hardware backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryPayload {
    pub temperature: f64,
    pub humidity: f64,
    pub power: f64,
    pub cpu_load: f64,
    pub memory_load: f64,
    #[serde(alias = "net_up")]
    pub net_up_bytes_per_sec: u64,
    #[serde(alias = "net_down")]
    pub net_down_bytes_per_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at_unix_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected event '{0}'")]
    UnknownEvent(String),
    #[error("payload does not match the telemetry shape: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("field {0} is not a finite number")]
    NonFinite(&'static str),
}

impl TelemetryEvent {
    pub fn telemetry(payload: &TelemetryPayload) -> Result<Self, serde_json::Error> {
        Ok(Self {
            name: TELEMETRY_EVENT.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Validates the event into a sample. Samples without a capture time are stamped
    /// with `received_at_unix_ms`.
    pub fn decode(self, received_at_unix_ms: i64) -> Result<TelemetrySample, DecodeError> {
        if self.name != TELEMETRY_EVENT {
            return Err(DecodeError::UnknownEvent(self.name));
        }
        let payload: TelemetryPayload = serde_json::from_value(self.payload)?;

        for (field, value) in [
            ("temperature", payload.temperature),
            ("humidity", payload.humidity),
            ("power", payload.power),
            ("cpu_load", payload.cpu_load),
            ("memory_load", payload.memory_load),
        ] {
            if !value.is_finite() {
                return Err(DecodeError::NonFinite(field));
            }
        }

        Ok(TelemetrySample {
            temperature: payload.temperature,
            humidity: payload.humidity,
            power: payload.power,
            cpu_load: payload.cpu_load,
            memory_load: payload.memory_load,
            net_up_bytes_per_sec: payload.net_up_bytes_per_sec,
            net_down_bytes_per_sec: payload.net_down_bytes_per_sec,
            captured_at_unix_ms: payload.captured_at_unix_ms.unwrap_or(received_at_unix_ms),
        })
    }
}

#[derive(Debug, Error)]
#[error("subscriber failed: {0}")]
pub struct SubscriberError(pub String);

pub type Subscriber = Box<dyn Fn(&TelemetrySample) -> Result<(), SubscriberError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Bounded sample history with a synchronous observer list.
///
/// Subscribers run inside `ingest` while the caller holds the store, so they must not
/// try to lock the store again; forward into a channel instead.
pub struct TelemetryStore {
    capacity: usize,
    history: VecDeque<TelemetrySample>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_id: u64,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl TelemetryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            history: VecDeque::with_capacity(capacity),
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn shared(capacity: usize) -> SharedTelemetry {
        Arc::new(RwLock::new(Self::new(capacity)))
    }

    pub fn ingest(&mut self, sample: TelemetrySample) -> NotifyReport {
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample);

        let mut report = NotifyReport::default();
        let Some(latest) = self.history.back() else {
            return report;
        };

        for (id, subscriber) in &self.subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber(latest))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(subscriber = id.0, error = %err, "telemetry subscriber failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(subscriber = id.0, "telemetry subscriber panicked");
                }
            }
        }
        report
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&TelemetrySample) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        before != self.subscribers.len()
    }

    pub fn latest(&self) -> Option<TelemetrySample> {
        self.history.back().cloned()
    }

    pub fn history(&self) -> Vec<TelemetrySample> {
        self.history.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

/// Normal below 50, warning from 50 up to and including 80, critical above 80.
pub fn classify(value: f64) -> Severity {
    if value > 80.0 {
        Severity::Critical
    } else if value >= 50.0 {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleSeverity {
    pub temperature: Severity,
    pub humidity: Severity,
    pub power: Severity,
    pub cpu_load: Severity,
    pub memory_load: Severity,
}

impl SampleSeverity {
    pub fn for_sample(sample: &TelemetrySample) -> Self {
        Self {
            temperature: classify(sample.temperature),
            humidity: classify(sample.humidity),
            power: classify(sample.power),
            cpu_load: classify(sample.cpu_load),
            memory_load: classify(sample.memory_load),
        }
    }

    pub fn worst(&self) -> Severity {
        [
            self.temperature,
            self.humidity,
            self.power,
            self.cpu_load,
            self.memory_load,
        ]
        .into_iter()
        .max()
        .unwrap_or(Severity::Normal)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    // compare the value as printed so 1023.95KB becomes 1.0MB, not 1024.0KB
    while (value * 10.0).round() >= 10240.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

pub async fn run_ingest(
    mut events: mpsc::Receiver<TelemetryEvent>,
    store: SharedTelemetry,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("telemetry ingest stopping");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    info!("telemetry event stream closed");
                    break;
                };
                match event.decode(now_unix_ms()) {
                    Ok(sample) => {
                        let (report, len) = {
                            let mut guard = store.write().await;
                            let report = guard.ingest(sample.clone());
                            (report, guard.len())
                        };
                        metrics.inc_telemetry_event("accepted");
                        metrics.observe_sample(&sample, len);
                        if report.failed > 0 {
                            debug!(failed = report.failed, delivered = report.delivered, "some subscribers failed");
                        }
                    }
                    Err(err) => {
                        metrics.inc_telemetry_event("malformed");
                        debug!(error = %err, "discarding malformed telemetry event");
                    }
                }
            }
        }
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample(n: u64) -> TelemetrySample {
        TelemetrySample {
            temperature: 21.5,
            humidity: 40.0,
            power: 120.0,
            cpu_load: 35.0,
            memory_load: 60.0,
            net_up_bytes_per_sec: n,
            net_down_bytes_per_sec: n * 2,
            captured_at_unix_ms: n as i64,
        }
    }

    #[test]
    fn history_is_bounded_and_fifo() {
        let mut store = TelemetryStore::default();
        assert!(store.latest().is_none());

        for n in 1..=51 {
            store.ingest(sample(n));
        }

        let history = store.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(store.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].captured_at_unix_ms, 2);
        assert_eq!(store.latest().unwrap().captured_at_unix_ms, 51);
        assert_eq!(history.last(), store.latest().as_ref());
    }

    #[test]
    fn history_snapshot_is_detached() {
        let mut store = TelemetryStore::new(5);
        store.ingest(sample(1));

        let mut snapshot = store.history();
        snapshot.clear();
        snapshot.push(sample(99));

        assert_eq!(store.len(), 1);
        assert_eq!(store.latest().unwrap().captured_at_unix_ms, 1);
    }

    #[test]
    fn failing_subscribers_do_not_block_others() {
        let mut store = TelemetryStore::default();
        let seen = Arc::new(AtomicUsize::new(0));

        store.subscribe(|_| Err(SubscriberError("closed".to_string())));
        store.subscribe(|_| panic!("subscriber bug"));
        let counter = seen.clone();
        store.subscribe(move |s| {
            assert_eq!(s.net_up_bytes_per_sec, counter.load(Ordering::SeqCst) as u64 + 1);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let first = store.ingest(sample(1));
        let second = store.ingest(sample(2));

        assert_eq!(first, NotifyReport { delivered: 1, failed: 2 });
        assert_eq!(second, NotifyReport { delivered: 1, failed: 2 });
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn subscribe_has_no_replay_and_unsubscribe_stops_delivery() {
        let mut store = TelemetryStore::default();
        store.ingest(sample(1));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        store.ingest(sample(2));
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.ingest(sample(3));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(classify(49.9), Severity::Normal);
        assert_eq!(classify(50.0), Severity::Warning);
        assert_eq!(classify(80.0), Severity::Warning);
        assert_eq!(classify(80.1), Severity::Critical);

        let mut s = sample(0);
        s.cpu_load = 95.0;
        let severity = SampleSeverity::for_sample(&s);
        assert_eq!(severity.cpu_load, Severity::Critical);
        assert_eq!(severity.memory_load, Severity::Warning);
        assert_eq!(severity.temperature, Severity::Normal);
        assert_eq!(severity.worst(), Severity::Critical);
    }

    #[test]
    fn bandwidth_formatting() {
        assert_eq!(format_bytes(0), "0.0B");
        assert_eq!(format_bytes(512), "512.0B");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bytes(2_097_152), "2.0MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0GB");
        assert_eq!(format_bytes(u64::MAX), "16777216.0TB");
    }

    #[test]
    fn values_that_round_up_move_to_the_next_unit() {
        assert_eq!(format_bytes(1023), "1023.0B");
        assert_eq!(format_bytes(1_048_575), "1.0MB");
        assert_eq!(format_bytes(1_073_741_823), "1.0GB");
        assert_eq!(format_bytes(1_048_000), "1023.4KB");
    }

    #[test]
    fn decode_accepts_backend_field_names() {
        let event = TelemetryEvent {
            name: TELEMETRY_EVENT.to_string(),
            payload: json!({
                "temperature": 23.0, "humidity": 45.5, "power": 88.0,
                "cpu_load": 12.5, "memory_load": 40.0,
                "net_up": 1024, "net_down": 2097152
            }),
        };
        let sample = event.decode(1_700).unwrap();
        assert_eq!(sample.net_down_bytes_per_sec, 2_097_152);
        assert_eq!(sample.captured_at_unix_ms, 1_700);
    }

    #[test]
    fn decode_rejects_malformed_events() {
        let wrong_name = TelemetryEvent {
            name: "device-change".to_string(),
            payload: json!({}),
        };
        assert!(matches!(wrong_name.decode(0), Err(DecodeError::UnknownEvent(_))));

        let missing = TelemetryEvent {
            name: TELEMETRY_EVENT.to_string(),
            payload: json!({ "temperature": 20.0 }),
        };
        assert!(matches!(missing.decode(0), Err(DecodeError::Payload(_))));

        let negative = TelemetryEvent {
            name: TELEMETRY_EVENT.to_string(),
            payload: json!({
                "temperature": 1.0, "humidity": 1.0, "power": 1.0,
                "cpu_load": 1.0, "memory_load": 1.0,
                "net_up": -5, "net_down": 0
            }),
        };
        assert!(negative.decode(0).is_err());
    }

    #[tokio::test]
    async fn ingest_loop_discards_malformed_and_keeps_valid() {
        let store = TelemetryStore::shared(HISTORY_CAPACITY);
        let metrics = Metrics::new().expect("metrics");
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(TelemetryEvent {
            name: TELEMETRY_EVENT.to_string(),
            payload: json!("garbage"),
        })
        .await
        .unwrap();
        let payload = TelemetryPayload {
            net_down_bytes_per_sec: 2_097_152,
            ..TelemetryPayload::default()
        };
        tx.send(TelemetryEvent::telemetry(&payload).unwrap())
            .await
            .unwrap();
        drop(tx);

        run_ingest(rx, store.clone(), metrics, shutdown_rx).await;

        let guard = store.read().await;
        assert_eq!(guard.len(), 1);
        let latest = guard.latest().unwrap();
        assert_eq!(format_bytes(latest.net_down_bytes_per_sec), "2.0MB");
    }
}
