mod aliases;
mod backend;
mod collectors;
mod config;
mod drivers;
mod http;
mod metrics;
mod rgb;
mod safety;
mod signal;
mod telemetry;
mod topology;

use aliases::AliasFile;
use axum::serve;
use backend::local::LocalBackend;
use backend::openrgb::OpenRgbClient;
use backend::{DeviceBackend, DriverBackend, RgbBackend};
use clap::Parser;
use collectors::EnvReadings;
use config::Config;
use drivers::DriverPoller;
use metrics::Metrics;
use rgb::RgbSession;
use safety::SafetyGate;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{SubscriberError, TelemetrySample, TelemetryStore};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use topology::TopologyService;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aether-core")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    let addr: SocketAddr = match cfg.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, listen = %cfg.listen, "invalid listen address");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.telemetry.interval_secs,
        drivers = cfg.drivers.registry.len(),
        "starting aether-core"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let local = Arc::new(match &cfg.devices.usb_sysfs_root {
        Some(root) => LocalBackend::with_usb_root(root),
        None => LocalBackend::new(),
    });
    let device_backend: Arc<dyn DeviceBackend> = local.clone();
    let driver_backend: Arc<dyn DriverBackend> = local;
    let rgb_backend: Arc<dyn RgbBackend> = Arc::new(OpenRgbClient::new(
        &cfg.rgb.host,
        cfg.rgb.port,
        cfg.rgb.client_name.clone(),
    ));

    let telemetry = TelemetryStore::shared(cfg.telemetry.history_capacity);
    let (live_tx, _) = broadcast::channel::<TelemetrySample>(64);
    let (latest_tx, latest_rx) = watch::channel::<Option<TelemetrySample>>(None);
    {
        let mut store = telemetry.write().await;
        let live = live_tx.clone();
        store.subscribe(move |sample| {
            // no websocket clients is not a failure
            let _ = live.send(sample.clone());
            Ok(())
        });
        store.subscribe(move |sample| {
            latest_tx
                .send(Some(sample.clone()))
                .map_err(|err| SubscriberError(err.to_string()))
        });
    }

    let topology = Arc::new(TopologyService::new(
        device_backend.clone(),
        AliasFile::new(cfg.devices.alias_file.as_ref().map(PathBuf::from)),
        cfg.topology.clone(),
    ));
    let gate = Arc::new(SafetyGate::new(
        device_backend.clone(),
        cfg.safety.critical_keywords.clone(),
    ));
    let rgb = Arc::new(RgbSession::new(rgb_backend, cfg.rgb.brightness_percent));
    let drivers = Arc::new(DriverPoller::new(driver_backend, &cfg.drivers.registry));
    metrics.update_topology(&topology.graph().await);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (env_tx, env_rx) = watch::channel(EnvReadings::default());
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(telemetry::run_ingest(
        event_rx,
        telemetry.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(collectors::run_collector(
        Duration::from_secs(cfg.telemetry.interval_secs),
        env_rx,
        event_tx,
        metrics.clone(),
        shutdown_rx.clone(),
    )));

    if cfg.sensors.enabled {
        tasks.push(tokio::spawn(collectors::sensors::run_sensor_listener(
            cfg.sensors.clone(),
            env_tx,
            shutdown_rx.clone(),
        )));
    }

    tasks.push(tokio::spawn(topology::run_follower(
        topology.clone(),
        latest_rx,
        metrics.clone(),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(topology::run_device_refresh(
        topology.clone(),
        Duration::from_secs(cfg.devices.refresh_interval_secs),
        metrics.clone(),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(drivers.clone().run(
        Duration::from_secs(cfg.drivers.poll_interval_secs),
        metrics.clone(),
        shutdown_rx.clone(),
    )));

    let http_task = {
        let app = http::build_router(http::HttpAppState {
            metrics: metrics.clone(),
            telemetry: telemetry.clone(),
            live: live_tx,
            topology,
            gate,
            rgb,
            drivers,
            devices: device_backend,
            listen_port: addr.port(),
            shutdown: shutdown_rx.clone(),
        });
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP listener");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
