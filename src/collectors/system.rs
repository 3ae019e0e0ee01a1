use crate::collectors::SystemSnapshot;
use std::time::Duration;
use sysinfo::{CpuExt, NetworkExt, NetworksExt, System, SystemExt};
use tracing::debug;

/// Refreshes CPU, memory and network counters. Network rates are the bytes moved since
/// the previous refresh divided by `since_last`.
pub fn collect_system(system: &mut System, since_last: Duration) -> SystemSnapshot {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_networks();

    let cpu_load_percent = if system.cpus().is_empty() {
        0.0
    } else {
        let sum: f32 = system.cpus().iter().map(|c| c.cpu_usage()).sum();
        (sum / system.cpus().len() as f32) as f64
    };
    let memory_load_percent = percent(system.used_memory(), system.total_memory());

    let (received, transmitted) = system
        .networks()
        .iter()
        .fold((0_u64, 0_u64), |(rx, tx), (_, data)| {
            (
                rx.saturating_add(data.received()),
                tx.saturating_add(data.transmitted()),
            )
        });

    let snapshot = SystemSnapshot {
        cpu_load_percent,
        memory_load_percent,
        net_up_bytes_per_sec: per_second(transmitted, since_last),
        net_down_bytes_per_sec: per_second(received, since_last),
    };
    debug!(
        cpu = snapshot.cpu_load_percent,
        memory = snapshot.memory_load_percent,
        up = snapshot.net_up_bytes_per_sec,
        down = snapshot.net_down_bytes_per_sec,
        "host sampled"
    );
    snapshot
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

fn per_second(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs < 0.001 {
        return 0;
    }
    (bytes as f64 / secs).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_percent_handles_empty_total() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(512, 2048), 25.0);
        assert_eq!(percent(4096, 2048), 100.0);
    }

    #[test]
    fn rates_are_per_second() {
        assert_eq!(per_second(4_194_304, Duration::from_secs(2)), 2_097_152);
        assert_eq!(per_second(1_000, Duration::from_millis(500)), 2_000);
        assert_eq!(per_second(1_000, Duration::ZERO), 0);
    }

    #[test]
    fn live_snapshot_is_in_range() {
        let mut system = System::new_all();
        let snapshot = collect_system(&mut system, Duration::from_secs(1));
        assert!((0.0..=100.0).contains(&snapshot.memory_load_percent));
        assert!(snapshot.cpu_load_percent >= 0.0);
    }
}
