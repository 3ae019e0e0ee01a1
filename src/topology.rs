//! Host/peripheral graph derived from the device list and the latest telemetry.

use crate::aliases::{merge_aliases, AliasFile};
use crate::backend::{BackendError, Device, DeviceBackend};
use crate::config::TopologyConfig;
use crate::metrics::Metrics;
use crate::signal::{clamp_load, signal, EdgeSignal};
use crate::telemetry::TelemetrySample;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const HOST_NODE_ID: &str = "host";
const ARC_RADIUS: f64 = 250.0;
const COLUMN_X: f64 = 500.0;
const COLUMN_SPACING: f64 = 200.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Arc,
    Column,
}

/// Telemetry value that drives every edge load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMetric {
    #[default]
    CpuLoad,
    MemoryLoad,
    NetUp,
    NetDown,
}

impl LoadMetric {
    /// Extracts the bound value as a 0..=100 load. Network rates are scaled against
    /// `net_saturation` bytes per second.
    pub fn load_of(self, sample: &TelemetrySample, net_saturation: u64) -> f64 {
        let rate = |bytes: u64| bytes as f64 / net_saturation.max(1) as f64 * 100.0;
        let raw = match self {
            Self::CpuLoad => sample.cpu_load,
            Self::MemoryLoad => sample.memory_load,
            Self::NetUp => rate(sample.net_up_bytes_per_sec),
            Self::NetDown => rate(sample.net_down_bytes_per_sec),
        };
        clamp_load(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Host,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyNode {
    pub id: String,
    pub kind: NodeKind,
    /// Hardware id of the device behind a peripheral node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub position: Position,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyEdge {
    pub id: String,
    pub source: String,
    pub source_port: String,
    pub target: String,
    pub load: f64,
    pub signal: EdgeSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyGraph {
    pub revision: u64,
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
}

pub fn port_id(index: usize) -> String {
    format!("port-{index}")
}

/// Peripheral node ids live under their own prefix so no device id can collide with the
/// host node.
pub fn peripheral_node_id(device_id: &str) -> String {
    format!("dev:{device_id}")
}

/// Builds the full graph for `devices`. Ports are handed out round-robin once the device
/// count exceeds `capacity`. Device ids are expected to be unique.
pub fn build_graph(devices: &[Device], capacity: usize, layout: Layout, load: f64) -> TopologyGraph {
    let capacity = capacity.max(1);
    let load = clamp_load(load);
    let edge_signal = signal(load);

    let mut nodes = Vec::with_capacity(devices.len() + 1);
    nodes.push(TopologyNode {
        id: HOST_NODE_ID.to_string(),
        kind: NodeKind::Host,
        device_id: None,
        label: "Host".to_string(),
        class: None,
        icon: None,
        position: Position { x: 0.0, y: 0.0 },
        ports: (0..capacity).map(port_id).collect(),
    });

    let mut edges = Vec::with_capacity(devices.len());
    for (i, device) in devices.iter().enumerate() {
        let node_id = peripheral_node_id(&device.id);
        nodes.push(TopologyNode {
            id: node_id.clone(),
            kind: NodeKind::Peripheral,
            device_id: Some(device.id.clone()),
            label: device.display_name().to_string(),
            class: Some(device.class.clone()),
            icon: device.icon.clone(),
            position: position(layout, i, devices.len()),
            ports: Vec::new(),
        });
        edges.push(TopologyEdge {
            id: format!("e-{HOST_NODE_ID}-{node_id}"),
            source: HOST_NODE_ID.to_string(),
            source_port: port_id(i % capacity),
            target: node_id,
            load,
            signal: edge_signal,
        });
    }

    TopologyGraph {
        revision: 0,
        nodes,
        edges,
    }
}

fn position(layout: Layout, index: usize, count: usize) -> Position {
    match layout {
        Layout::Arc => {
            let angle = index as f64 / count.max(1) as f64 * 2.0 * PI;
            Position {
                x: angle.cos() * ARC_RADIUS,
                y: angle.sin() * ARC_RADIUS,
            }
        }
        Layout::Column => {
            let offset = index as f64 - (count.saturating_sub(1)) as f64 / 2.0;
            Position {
                x: COLUMN_X,
                y: offset * COLUMN_SPACING,
            }
        }
    }
}

fn dedupe(devices: Vec<Device>) -> Vec<Device> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| seen.insert(d.id.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied { changed: bool, devices: usize },
    /// A newer refresh already landed; this result was dropped.
    Stale,
}

struct TopologyState {
    devices: Vec<Device>,
    bound_load: Option<f64>,
    graph: TopologyGraph,
    applied_generation: u64,
}

pub struct TopologyService {
    backend: Arc<dyn DeviceBackend>,
    aliases: AliasFile,
    cfg: TopologyConfig,
    issued_generation: AtomicU64,
    state: RwLock<TopologyState>,
}

impl TopologyService {
    pub fn new(backend: Arc<dyn DeviceBackend>, aliases: AliasFile, cfg: TopologyConfig) -> Self {
        let graph = build_graph(&[], cfg.port_capacity, cfg.layout, cfg.idle_load);
        Self {
            backend,
            aliases,
            cfg,
            issued_generation: AtomicU64::new(0),
            state: RwLock::new(TopologyState {
                devices: Vec::new(),
                bound_load: None,
                graph,
                applied_generation: 0,
            }),
        }
    }

    /// Fetches the device list, merges aliases and rebuilds when it changed. A backend
    /// failure leaves the previous list and graph in place.
    pub async fn refresh_devices(&self) -> Result<RefreshOutcome, BackendError> {
        let generation = self.issued_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let devices = self.backend.get_devices().await?;

        let book = match self.aliases.load() {
            Ok(book) => book,
            Err(err) => {
                warn!(error = %err, "alias file unreadable, continuing without aliases");
                Default::default()
            }
        };
        let devices = merge_aliases(dedupe(devices), &book);

        let mut state = self.state.write().await;
        if generation <= state.applied_generation {
            debug!(
                generation,
                applied = state.applied_generation,
                "discarding stale device refresh"
            );
            return Ok(RefreshOutcome::Stale);
        }
        state.applied_generation = generation;

        let count = devices.len();
        let changed = state.devices != devices;
        if changed {
            state.devices = devices;
            self.rebuild(&mut state);
            info!(devices = count, revision = state.graph.revision, "device list changed");
        }
        Ok(RefreshOutcome::Applied {
            changed,
            devices: count,
        })
    }

    /// Rebuilds only when the bound telemetry value moved. Returns whether it did.
    pub async fn on_telemetry(&self, sample: &TelemetrySample) -> bool {
        let load = self
            .cfg
            .bound_metric
            .load_of(sample, self.cfg.net_saturation_bytes_per_sec);
        let mut state = self.state.write().await;
        if state.bound_load == Some(load) {
            return false;
        }
        state.bound_load = Some(load);
        self.rebuild(&mut state);
        true
    }

    fn rebuild(&self, state: &mut TopologyState) {
        let load = state.bound_load.unwrap_or(self.cfg.idle_load);
        let revision = state.graph.revision + 1;
        state.graph = build_graph(&state.devices, self.cfg.port_capacity, self.cfg.layout, load);
        state.graph.revision = revision;
    }

    pub async fn graph(&self) -> TopologyGraph {
        self.state.read().await.graph.clone()
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.state.read().await.devices.clone()
    }

    pub async fn device(&self, id: &str) -> Option<Device> {
        self.state
            .read()
            .await
            .devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }
}

pub async fn run_device_refresh(
    service: Arc<TopologyService>,
    interval: Duration,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("device refresh stopping");
                break;
            }
            _ = ticker.tick() => {
                match service.refresh_devices().await {
                    Ok(RefreshOutcome::Applied { changed: true, .. }) => {
                        metrics.record_rebuild(&service.graph().await);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        metrics.inc_backend_failure("get_devices");
                        warn!(error = %err, "device refresh failed");
                    }
                }
            }
        }
    }
}

/// Follows the latest-sample channel fed by a telemetry subscriber.
pub async fn run_follower(
    service: Arc<TopologyService>,
    mut samples: watch::Receiver<Option<TelemetrySample>>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("topology follower stopping");
                break;
            }
            changed = samples.changed() => {
                if changed.is_err() {
                    break;
                }
                let sample = samples.borrow_and_update().clone();
                if let Some(sample) = sample {
                    if service.on_telemetry(&sample).await {
                        metrics.record_rebuild(&service.graph().await);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeDevices;
    use tokio::sync::Notify;

    fn devices(n: usize) -> Vec<Device> {
        (0..n)
            .map(|i| Device::new(format!("1-{i}"), format!("Device {i}"), "HID"))
            .collect()
    }

    fn sample_with_cpu(cpu_load: f64) -> TelemetrySample {
        TelemetrySample {
            temperature: 22.0,
            humidity: 40.0,
            power: 90.0,
            cpu_load,
            memory_load: 30.0,
            net_up_bytes_per_sec: 0,
            net_down_bytes_per_sec: 6_250_000,
            captured_at_unix_ms: 0,
        }
    }

    fn service(fake: Arc<FakeDevices>) -> TopologyService {
        TopologyService::new(fake, AliasFile::default(), TopologyConfig::default())
    }

    #[test]
    fn empty_device_list_is_host_only() {
        let graph = build_graph(&[], 4, Layout::Arc, 10.0);
        assert_eq!(graph.nodes.len(), 1);
        assert!(graph.edges.is_empty());
        let host = &graph.nodes[0];
        assert_eq!(host.kind, NodeKind::Host);
        assert_eq!(host.ports, vec!["port-0", "port-1", "port-2", "port-3"]);
        assert_eq!(host.position, Position { x: 0.0, y: 0.0 });
    }

    #[test]
    fn device_named_like_the_host_gets_its_own_node() {
        let graph = build_graph(
            &[
                Device::new("host", "Docking Station", "Hub"),
                Device::new("1-2", "Wireless Mouse", "HID"),
            ],
            4,
            Layout::Arc,
            10.0,
        );

        let ids: Vec<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["host", "dev:host", "dev:1-2"]);
        let hosts = graph.nodes.iter().filter(|n| n.kind == NodeKind::Host).count();
        assert_eq!(hosts, 1);
        assert_eq!(graph.nodes[1].device_id.as_deref(), Some("host"));
        assert_eq!(graph.edges[0].target, "dev:host");
        assert!(graph.edges.iter().all(|e| e.source == HOST_NODE_ID));
    }

    #[test]
    fn ports_are_reused_round_robin_beyond_capacity() {
        let graph = build_graph(&devices(5), 4, Layout::Arc, 10.0);
        assert_eq!(graph.nodes.len(), 6);
        assert_eq!(graph.edges.len(), 5);
        let ports: Vec<&str> = graph.edges.iter().map(|e| e.source_port.as_str()).collect();
        assert_eq!(ports, vec!["port-0", "port-1", "port-2", "port-3", "port-0"]);
    }

    #[test]
    fn ports_are_unique_within_capacity() {
        let graph = build_graph(&devices(4), 4, Layout::Column, 10.0);
        let unique: HashSet<&str> = graph.edges.iter().map(|e| e.source_port.as_str()).collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn edges_carry_clamped_load_and_its_signal() {
        let graph = build_graph(&devices(2), 4, Layout::Arc, 140.0);
        for edge in &graph.edges {
            assert_eq!(edge.load, 100.0);
            assert_eq!(edge.signal, signal(100.0));
            assert!(edge.signal.is_alert);
        }
    }

    #[test]
    fn column_layout_is_centered() {
        let graph = build_graph(&devices(3), 4, Layout::Column, 10.0);
        let ys: Vec<f64> = graph.nodes[1..].iter().map(|n| n.position.y).collect();
        assert_eq!(ys, vec![-200.0, 0.0, 200.0]);
        assert!(graph.nodes[1..].iter().all(|n| n.position.x == 500.0));
    }

    #[test]
    fn arc_layout_spreads_evenly() {
        let graph = build_graph(&devices(4), 4, Layout::Arc, 10.0);
        let first = graph.nodes[1].position;
        let second = graph.nodes[2].position;
        assert!((first.x - 250.0).abs() < 1e-9 && first.y.abs() < 1e-9);
        assert!(second.x.abs() < 1e-9 && (second.y - 250.0).abs() < 1e-9);
    }

    #[test]
    fn network_metric_is_scaled_by_saturation() {
        let sample = sample_with_cpu(5.0);
        assert_eq!(LoadMetric::NetDown.load_of(&sample, 12_500_000), 50.0);
        assert_eq!(LoadMetric::NetDown.load_of(&sample, 1_000), 100.0);
        assert_eq!(LoadMetric::CpuLoad.load_of(&sample, 1), 5.0);
    }

    #[tokio::test]
    async fn refresh_uses_idle_load_until_telemetry_arrives() {
        let fake = Arc::new(FakeDevices::with_devices(devices(2)));
        let svc = service(fake);

        let outcome = svc.refresh_devices().await.unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome::Applied {
                changed: true,
                devices: 2
            }
        );
        let graph = svc.graph().await;
        assert!(graph.edges.iter().all(|e| e.load == 10.0));

        assert!(svc.on_telemetry(&sample_with_cpu(90.0)).await);
        let graph = svc.graph().await;
        assert!(graph.edges.iter().all(|e| e.load == 90.0 && e.signal.is_alert));
    }

    #[tokio::test]
    async fn rebuild_only_when_bound_value_changes() {
        let fake = Arc::new(FakeDevices::with_devices(devices(1)));
        let svc = service(fake);
        svc.refresh_devices().await.unwrap();

        assert!(svc.on_telemetry(&sample_with_cpu(40.0)).await);
        let revision = svc.graph().await.revision;

        let mut other = sample_with_cpu(40.0);
        other.memory_load = 99.0;
        other.temperature = 60.0;
        assert!(!svc.on_telemetry(&other).await);
        assert_eq!(svc.graph().await.revision, revision);

        assert!(svc.on_telemetry(&sample_with_cpu(41.0)).await);
        assert_eq!(svc.graph().await.revision, revision + 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_graph() {
        let fake = Arc::new(FakeDevices::with_devices(devices(3)));
        fake.push_response(Err(BackendError::Request("bus reset".to_string())));
        let svc = service(fake);

        svc.refresh_devices().await.unwrap();
        let before = svc.graph().await;
        assert!(svc.refresh_devices().await.is_err());
        assert_eq!(svc.graph().await, before);
        assert_eq!(svc.devices().await.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_ids_keep_first_occurrence() {
        let mut list = devices(2);
        list.push(Device::new("1-0", "Imposter", "HID"));
        let fake = Arc::new(FakeDevices::with_devices(list));
        let svc = service(fake);

        svc.refresh_devices().await.unwrap();
        assert_eq!(svc.devices().await.len(), 2);
        assert_eq!(svc.device("1-0").await.unwrap().name, "Device 0");
        assert!(svc.device("9-9").await.is_none());
    }

    #[tokio::test]
    async fn slower_older_refresh_is_discarded() {
        let fake = Arc::new(FakeDevices::default());
        fake.push_response(Ok(devices(1)));
        fake.push_response(Ok(devices(3)));
        let release = Arc::new(Notify::new());
        *fake.hold_next.lock().unwrap() = Some(release.clone());
        let svc = Arc::new(service(fake.clone()));

        let first = tokio::spawn({
            let svc = svc.clone();
            async move { svc.refresh_devices().await }
        });
        while fake.get_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = svc.refresh_devices().await.unwrap();
        assert_eq!(
            second,
            RefreshOutcome::Applied {
                changed: true,
                devices: 3
            }
        );

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, RefreshOutcome::Stale);
        assert_eq!(svc.devices().await.len(), 3);
    }
}
