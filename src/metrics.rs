use crate::drivers::DriverInfo;
use crate::telemetry::TelemetrySample;
use crate::topology::TopologyGraph;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: Instant,
    pub aether_temperature_celsius: Gauge,
    pub aether_humidity_percent: Gauge,
    pub aether_power_watts: Gauge,
    pub aether_cpu_load_percent: Gauge,
    pub aether_memory_load_percent: Gauge,
    pub aether_net_up_bytes_per_sec: Gauge,
    pub aether_net_down_bytes_per_sec: Gauge,
    pub aether_telemetry_history_len: Gauge,
    pub aether_last_sample_timestamp_seconds: Gauge,
    pub aether_telemetry_events_total: CounterVec,
    pub aether_topology_nodes: Gauge,
    pub aether_topology_edges: Gauge,
    pub aether_topology_alert_edges: Gauge,
    pub aether_topology_rebuilds_total: Counter,
    pub aether_driver_running: GaugeVec,
    pub aether_backend_failures_total: CounterVec,
    pub aether_safety_dispatch_total: CounterVec,
    pub aether_rgb_commands_total: CounterVec,
    pub aether_uptime_seconds: Gauge,
    pub aether_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let aether_temperature_celsius = Gauge::with_opts(opts!(
            "aether_temperature_celsius",
            "Latest ambient temperature in Celsius"
        ))?;
        let aether_humidity_percent = Gauge::with_opts(opts!(
            "aether_humidity_percent",
            "Latest relative humidity in percent"
        ))?;
        let aether_power_watts =
            Gauge::with_opts(opts!("aether_power_watts", "Latest power draw in watts"))?;
        let aether_cpu_load_percent = Gauge::with_opts(opts!(
            "aether_cpu_load_percent",
            "Latest CPU load in percent (0..100)"
        ))?;
        let aether_memory_load_percent = Gauge::with_opts(opts!(
            "aether_memory_load_percent",
            "Latest memory load in percent (0..100)"
        ))?;
        let aether_net_up_bytes_per_sec = Gauge::with_opts(opts!(
            "aether_net_up_bytes_per_sec",
            "Latest upload rate in bytes per second"
        ))?;
        let aether_net_down_bytes_per_sec = Gauge::with_opts(opts!(
            "aether_net_down_bytes_per_sec",
            "Latest download rate in bytes per second"
        ))?;
        let aether_telemetry_history_len = Gauge::with_opts(opts!(
            "aether_telemetry_history_len",
            "Number of samples currently held in the telemetry history"
        ))?;
        let aether_last_sample_timestamp_seconds = Gauge::with_opts(opts!(
            "aether_last_sample_timestamp_seconds",
            "Capture time of the latest telemetry sample"
        ))?;
        let aether_telemetry_events_total = CounterVec::new(
            opts!(
                "aether_telemetry_events_total",
                "Telemetry events received by result"
            ),
            &["result"],
        )?;
        let aether_topology_nodes =
            Gauge::with_opts(opts!("aether_topology_nodes", "Nodes in the current topology"))?;
        let aether_topology_edges =
            Gauge::with_opts(opts!("aether_topology_edges", "Edges in the current topology"))?;
        let aether_topology_alert_edges = Gauge::with_opts(opts!(
            "aether_topology_alert_edges",
            "Edges currently signalling high load"
        ))?;
        let aether_topology_rebuilds_total = Counter::with_opts(opts!(
            "aether_topology_rebuilds_total",
            "Total number of topology rebuilds"
        ))?;
        let aether_driver_running = GaugeVec::new(
            opts!(
                "aether_driver_running",
                "Last polled liveness of a registered driver (1 running, 0 not)"
            ),
            &["driver"],
        )?;
        let aether_backend_failures_total = CounterVec::new(
            opts!(
                "aether_backend_failures_total",
                "Failed hardware backend requests by operation"
            ),
            &["operation"],
        )?;
        let aether_safety_dispatch_total = CounterVec::new(
            opts!(
                "aether_safety_dispatch_total",
                "Confirmed destructive device commands by outcome"
            ),
            &["outcome"],
        )?;
        let aether_rgb_commands_total = CounterVec::new(
            opts!(
                "aether_rgb_commands_total",
                "Lighting color commands by outcome"
            ),
            &["outcome"],
        )?;
        let aether_uptime_seconds =
            Gauge::with_opts(opts!("aether_uptime_seconds", "Daemon uptime in seconds"))?;
        let aether_scrape_count_total = Counter::with_opts(opts!(
            "aether_scrape_count_total",
            "Total number of /metrics scrapes"
        ))?;

        register(&registry, &aether_temperature_celsius)?;
        register(&registry, &aether_humidity_percent)?;
        register(&registry, &aether_power_watts)?;
        register(&registry, &aether_cpu_load_percent)?;
        register(&registry, &aether_memory_load_percent)?;
        register(&registry, &aether_net_up_bytes_per_sec)?;
        register(&registry, &aether_net_down_bytes_per_sec)?;
        register(&registry, &aether_telemetry_history_len)?;
        register(&registry, &aether_last_sample_timestamp_seconds)?;
        register(&registry, &aether_telemetry_events_total)?;
        register(&registry, &aether_topology_nodes)?;
        register(&registry, &aether_topology_edges)?;
        register(&registry, &aether_topology_alert_edges)?;
        register(&registry, &aether_topology_rebuilds_total)?;
        register(&registry, &aether_driver_running)?;
        register(&registry, &aether_backend_failures_total)?;
        register(&registry, &aether_safety_dispatch_total)?;
        register(&registry, &aether_rgb_commands_total)?;
        register(&registry, &aether_uptime_seconds)?;
        register(&registry, &aether_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Instant::now(),
            aether_temperature_celsius,
            aether_humidity_percent,
            aether_power_watts,
            aether_cpu_load_percent,
            aether_memory_load_percent,
            aether_net_up_bytes_per_sec,
            aether_net_down_bytes_per_sec,
            aether_telemetry_history_len,
            aether_last_sample_timestamp_seconds,
            aether_telemetry_events_total,
            aether_topology_nodes,
            aether_topology_edges,
            aether_topology_alert_edges,
            aether_topology_rebuilds_total,
            aether_driver_running,
            aether_backend_failures_total,
            aether_safety_dispatch_total,
            aether_rgb_commands_total,
            aether_uptime_seconds,
            aether_scrape_count_total,
        }))
    }

    pub fn observe_sample(&self, sample: &TelemetrySample, history_len: usize) {
        self.aether_temperature_celsius.set(sample.temperature);
        self.aether_humidity_percent.set(sample.humidity);
        self.aether_power_watts.set(sample.power);
        self.aether_cpu_load_percent.set(sample.cpu_load);
        self.aether_memory_load_percent.set(sample.memory_load);
        self.aether_net_up_bytes_per_sec
            .set(sample.net_up_bytes_per_sec as f64);
        self.aether_net_down_bytes_per_sec
            .set(sample.net_down_bytes_per_sec as f64);
        self.aether_telemetry_history_len.set(history_len as f64);
        self.aether_last_sample_timestamp_seconds
            .set(sample.captured_at_unix_ms as f64 / 1000.0);
    }

    pub fn update_topology(&self, graph: &TopologyGraph) {
        self.aether_topology_nodes.set(graph.nodes.len() as f64);
        self.aether_topology_edges.set(graph.edges.len() as f64);
        let alerts = graph.edges.iter().filter(|e| e.signal.is_alert).count();
        self.aether_topology_alert_edges.set(alerts as f64);
    }

    pub fn record_rebuild(&self, graph: &TopologyGraph) {
        self.update_topology(graph);
        self.aether_topology_rebuilds_total.inc();
    }

    pub fn update_drivers(&self, drivers: &[DriverInfo]) {
        self.aether_driver_running.reset();
        for d in drivers {
            self.aether_driver_running
                .with_label_values(&[&d.name])
                .set(if d.is_running { 1.0 } else { 0.0 });
        }
    }

    pub fn inc_telemetry_event(&self, result: &str) {
        self.aether_telemetry_events_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_backend_failure(&self, operation: &str) {
        self.aether_backend_failures_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn inc_safety_dispatch(&self, outcome: &str) {
        self.aether_safety_dispatch_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_rgb_command(&self, outcome: &str) {
        self.aether_rgb_commands_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.aether_scrape_count_total.inc();
        self.aether_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
