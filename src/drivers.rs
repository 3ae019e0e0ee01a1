use crate::backend::{BackendError, DriverBackend};
use crate::config::DriverEntry;
use crate::metrics::Metrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverInfo {
    pub name: String,
    /// Result of the last successful poll, never set optimistically.
    pub is_running: bool,
    pub launch_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DriverInfo {
    pub fn new(name: impl Into<String>, launch_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_running: false,
            launch_path: launch_path.into(),
            last_checked: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("'{0}' is not a registered driver launch path")]
    UnknownPath(String),
    #[error("driver launch failed: {0}")]
    Launch(#[source] BackendError),
}

#[derive(Debug, Default)]
pub struct PollReport {
    pub checked: usize,
    pub failed: Vec<(String, String)>,
    pub stale: usize,
}

struct DriverSlot {
    info: DriverInfo,
    applied_tick: u64,
}

/// Liveness cache for a fixed set of driver processes.
pub struct DriverPoller {
    backend: Arc<dyn DriverBackend>,
    slots: RwLock<Vec<DriverSlot>>,
    tick: AtomicU64,
}

impl DriverPoller {
    pub fn new(backend: Arc<dyn DriverBackend>, registry: &[DriverEntry]) -> Self {
        let slots = registry
            .iter()
            .map(|entry| DriverSlot {
                info: DriverInfo::new(&entry.name, &entry.launch_path),
                applied_tick: 0,
            })
            .collect();
        Self {
            backend,
            slots: RwLock::new(slots),
            tick: AtomicU64::new(0),
        }
    }

    pub async fn drivers(&self) -> Vec<DriverInfo> {
        self.slots
            .read()
            .await
            .iter()
            .map(|s| s.info.clone())
            .collect()
    }

    /// Issues one status query per registered name and applies each answer as it lands.
    /// Answers from an older poll than the one already applied for that name are dropped.
    pub async fn poll_once(&self) -> PollReport {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        let names: Vec<String> = self
            .slots
            .read()
            .await
            .iter()
            .map(|s| s.info.name.clone())
            .collect();

        let mut queries = JoinSet::new();
        for name in names {
            let backend = self.backend.clone();
            queries.spawn(async move {
                let result = backend.check_driver_status(&name).await;
                (name, result)
            });
        }

        let mut report = PollReport::default();
        while let Some(joined) = queries.join_next().await {
            let (name, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "driver status query aborted");
                    report.failed.push(("<unknown>".to_string(), err.to_string()));
                    continue;
                }
            };

            let mut slots = self.slots.write().await;
            let Some(slot) = slots.iter_mut().find(|s| s.info.name == name) else {
                continue;
            };
            if tick < slot.applied_tick {
                debug!(driver = %name, tick, applied = slot.applied_tick, "discarding stale driver status");
                report.stale += 1;
                continue;
            }
            slot.applied_tick = tick;
            report.checked += 1;

            match result {
                Ok(running) => {
                    if running != slot.info.is_running {
                        info!(driver = %name, running, "driver status changed");
                    }
                    slot.info.is_running = running;
                    slot.info.last_checked =
                        Some(humantime::format_rfc3339_seconds(SystemTime::now()).to_string());
                    slot.info.last_error = None;
                }
                Err(err) => {
                    warn!(driver = %name, error = %err, "driver status check failed");
                    slot.info.last_error = Some(err.to_string());
                    report.failed.push((name, err.to_string()));
                }
            }
        }
        report
    }

    /// Fires a one-shot launch request. The running flag only changes on a later poll.
    pub async fn launch(&self, path: &str) -> Result<(), DriverError> {
        let known = self
            .slots
            .read()
            .await
            .iter()
            .any(|s| s.info.launch_path == path);
        if !known {
            return Err(DriverError::UnknownPath(path.to_string()));
        }

        self.backend.launch_driver(path).await.map_err(|err| {
            warn!(path = %path, error = %err, "driver launch failed");
            DriverError::Launch(err)
        })?;
        info!(path = %path, "driver launch requested");
        Ok(())
    }

    /// Polls on every tick. Each poll runs in its own task so a hung query cannot hold
    /// back later ticks.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        metrics: Arc<Metrics>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("driver poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let poller = self.clone();
                    let metrics = metrics.clone();
                    in_flight.spawn(async move {
                        let report = poller.poll_once().await;
                        for _ in &report.failed {
                            metrics.inc_backend_failure("check_driver_status");
                        }
                        metrics.update_drivers(&poller.drivers().await);
                    });
                    while in_flight.try_join_next().is_some() {}
                }
            }
        }
        in_flight.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeDrivers;
    use tokio::sync::Notify;

    fn registry(names: &[&str]) -> Vec<DriverEntry> {
        names
            .iter()
            .map(|name| DriverEntry {
                name: name.to_string(),
                launch_path: format!("/opt/{name}/bin/{name}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn one_failing_query_does_not_affect_the_others() {
        let fake = Arc::new(FakeDrivers::default());
        fake.set("openrgb", Ok(true));
        fake.set("lghub", Err(BackendError::Request("access denied".to_string())));
        fake.set("steam", Ok(true));
        let poller = DriverPoller::new(fake.clone(), &registry(&["openrgb", "lghub", "steam"]));

        let report = poller.poll_once().await;
        assert_eq!(report.checked, 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "lghub");

        let drivers = poller.drivers().await;
        assert!(drivers[0].is_running);
        assert!(drivers[0].last_checked.is_some());
        assert!(!drivers[1].is_running);
        assert!(drivers[1].last_checked.is_none());
        assert!(drivers[1].last_error.is_some());
        assert!(drivers[2].is_running);
        assert_eq!(fake.checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn launch_does_not_flip_running_flag() {
        let fake = Arc::new(FakeDrivers::default());
        let poller = DriverPoller::new(fake.clone(), &registry(&["steam"]));

        poller.launch("/opt/steam/bin/steam").await.unwrap();
        assert_eq!(fake.launches.lock().unwrap().len(), 1);
        assert!(!poller.drivers().await[0].is_running);

        fake.set("steam", Ok(true));
        poller.poll_once().await;
        assert!(poller.drivers().await[0].is_running);
    }

    #[tokio::test]
    async fn launch_rejects_unregistered_paths() {
        let fake = Arc::new(FakeDrivers::default());
        let poller = DriverPoller::new(fake.clone(), &registry(&["steam"]));

        let err = poller.launch("/bin/sh").await.unwrap_err();
        assert!(matches!(err, DriverError::UnknownPath(_)));
        assert!(fake.launches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let fake = Arc::new(FakeDrivers::default());
        *fake.launch_failure.lock().unwrap() = Some(BackendError::Io("not found".to_string()));
        let poller = DriverPoller::new(fake.clone(), &registry(&["steam"]));

        let err = poller.launch("/opt/steam/bin/steam").await.unwrap_err();
        assert!(matches!(err, DriverError::Launch(BackendError::Io(_))));
    }

    #[tokio::test]
    async fn older_poll_answer_is_discarded() {
        let fake = Arc::new(FakeDrivers::default());
        fake.set("openrgb", Ok(false));
        let release = Arc::new(Notify::new());
        fake.hold
            .lock()
            .unwrap()
            .insert("openrgb".to_string(), release.clone());
        let poller = Arc::new(DriverPoller::new(fake.clone(), &registry(&["openrgb"])));

        let first = tokio::spawn({
            let poller = poller.clone();
            async move { poller.poll_once().await }
        });
        while fake.checks.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        fake.set("openrgb", Ok(true));
        let second = poller.poll_once().await;
        assert_eq!(second.checked, 1);

        release.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.stale, 1);
        assert!(poller.drivers().await[0].is_running);
    }
}
