//! Counter arithmetic shared by probes that sample monotonically increasing
//! values (interface octets, packet counts, log line offsets).
//!
//! The previous sample and the clock reading it was taken at live in the
//! item's result map under `<key>` and `<key>.clock`, so they survive between
//! dispatches.

use chrono::{DateTime, Utc};

use super::types::ResultMap;

/// Where the elapsed time between two samples comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Clock {
    /// Local wall-clock time of the sample.
    WallClock(DateTime<Utc>),
    /// Device uptime in seconds (e.g. sysUpTime / 100).
    Uptime(f64),
}

impl Clock {
    fn seconds(&self) -> f64 {
        match self {
            Clock::WallClock(at) => at.timestamp_millis() as f64 / 1000.0,
            Clock::Uptime(secs) => *secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// No previous sample; the current one becomes the baseline.
    Baseline,
    /// Counter went backwards (wrap, reboot, reset).
    Reset,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterDelta {
    pub kind: DeltaKind,
    pub delta: f64,
    /// Per-second rate, only when both the delta and elapsed time are usable.
    pub rate: Option<f64>,
}

impl CounterDelta {
    fn baseline() -> Self {
        Self { kind: DeltaKind::Baseline, delta: 0.0, rate: None }
    }

    fn reset() -> Self {
        Self { kind: DeltaKind::Reset, delta: 0.0, rate: None }
    }
}

/// Rate over `elapsed_secs`, or `None` when the interval is not positive.
pub fn rate_per_second(delta: f64, elapsed_secs: f64) -> Option<f64> {
    if elapsed_secs > 0.0 && delta.is_finite() {
        Some(delta / elapsed_secs)
    } else {
        None
    }
}

/// Delta between two readings without touching any stored state.
pub fn compute_delta(previous: Option<f64>, current: f64, elapsed_secs: Option<f64>) -> CounterDelta {
    let Some(previous) = previous else {
        return CounterDelta::baseline();
    };
    let delta = current - previous;
    if delta < 0.0 {
        return CounterDelta::reset();
    }
    CounterDelta {
        kind: DeltaKind::Advanced,
        delta,
        rate: elapsed_secs.and_then(|elapsed| rate_per_second(delta, elapsed)),
    }
}

fn clock_key(key: &str) -> String {
    format!("{key}.clock")
}

/// Compare `current` against the sample stored under `key`, then store
/// `current` as the new baseline.
pub fn record_counter(result: &mut ResultMap, key: &str, current: f64, clock: Clock) -> CounterDelta {
    let clock_key = clock_key(key);
    let previous = result.number(key);
    let now = clock.seconds();
    let elapsed = result.number(&clock_key).map(|before| now - before);

    let mut sample = compute_delta(previous, current, elapsed);
    // An uptime that went backwards means the device restarted between samples.
    if sample.kind == DeltaKind::Advanced && matches!(clock, Clock::Uptime(_)) && elapsed.is_some_and(|e| e < 0.0) {
        sample = CounterDelta::reset();
    }

    result.set_number(key, current);
    result.set_number(clock_key, now);
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_counter_reset_gives_no_rate() {
        let sample = compute_delta(Some(100.0), 80.0, Some(60.0));
        assert_eq!(sample.kind, DeltaKind::Reset);
        assert_eq!(sample.rate, None);
        assert_eq!(sample.delta, 0.0);
    }

    #[test]
    fn test_first_observation_stores_baseline() {
        let mut result = ResultMap::new();
        let sample = record_counter(&mut result, "ifInOctets", 5000.0, Clock::WallClock(Utc::now()));
        assert_eq!(sample.kind, DeltaKind::Baseline);
        assert_eq!(sample.delta, 0.0);
        assert_eq!(sample.rate, None);
        assert_eq!(result.number("ifInOctets"), Some(5000.0));
    }

    #[test]
    fn test_wall_clock_rate() {
        let t0 = Utc::now();
        let mut result = ResultMap::new();
        record_counter(&mut result, "octets", 1000.0, Clock::WallClock(t0));
        let sample = record_counter(&mut result, "octets", 7000.0, Clock::WallClock(t0 + Duration::seconds(60)));
        assert_eq!(sample.kind, DeltaKind::Advanced);
        assert_eq!(sample.delta, 6000.0);
        let rate = sample.rate.unwrap();
        assert!((rate - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_uptime_going_backwards_is_a_reset() {
        let mut result = ResultMap::new();
        record_counter(&mut result, "pkts", 10.0, Clock::Uptime(5000.0));
        let sample = record_counter(&mut result, "pkts", 20.0, Clock::Uptime(30.0));
        assert_eq!(sample.kind, DeltaKind::Reset);
        assert_eq!(sample.rate, None);
        assert_eq!(result.number("pkts"), Some(20.0));
    }

    #[test]
    fn test_zero_elapsed_has_delta_but_no_rate() {
        let sample = compute_delta(Some(10.0), 15.0, Some(0.0));
        assert_eq!(sample.delta, 5.0);
        assert_eq!(sample.rate, None);
    }
}
