use serde::Serialize;

pub const HIGH_LOAD_THRESHOLD: f64 = 80.0;
pub const IDLE_DURATION_SECS: f64 = 3.0;
pub const SATURATED_DURATION_SECS: f64 = 0.2;

/// Animation parameters for one topology edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EdgeSignal {
    pub duration_secs: f64,
    pub is_alert: bool,
}

/// Clamps a load into 0..=100. Non-finite loads count as idle.
pub fn clamp_load(load: f64) -> f64 {
    if load.is_nan() {
        return 0.0;
    }
    load.clamp(0.0, 100.0)
}

/// Maps a 0..=100 load to a pulse duration (3.0s idle down to 0.2s saturated) and an
/// alert flag above 80. Lower duration means a faster pulse.
pub fn signal(load: f64) -> EdgeSignal {
    let load = clamp_load(load);
    let t = load / 100.0;
    EdgeSignal {
        duration_secs: IDLE_DURATION_SECS * (1.0 - t) + SATURATED_DURATION_SECS * t,
        is_alert: load > HIGH_LOAD_THRESHOLD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn endpoints() {
        assert!(approx(signal(0.0).duration_secs, 3.0));
        assert!(approx(signal(100.0).duration_secs, 0.2));
        assert!(approx(signal(50.0).duration_secs, 1.6));
    }

    #[test]
    fn alert_threshold_is_strict() {
        assert!(signal(81.0).is_alert);
        assert!(!signal(80.0).is_alert);
        assert!(!signal(0.0).is_alert);
    }

    #[test]
    fn duration_never_increases_with_load() {
        let mut previous = signal(0.0).duration_secs;
        for step in 1..=1000 {
            let current = signal(step as f64 / 10.0).duration_secs;
            assert!(current <= previous, "duration rose at load {}", step as f64 / 10.0);
            previous = current;
        }
    }

    #[test]
    fn out_of_range_loads_are_clamped() {
        assert_eq!(signal(-25.0), signal(0.0));
        assert_eq!(signal(250.0), signal(100.0));
        assert_eq!(signal(f64::NAN), signal(0.0));
        assert_eq!(signal(f64::INFINITY), signal(100.0));
        assert!(signal(f64::INFINITY).is_alert);
    }
}
