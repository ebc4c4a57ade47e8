// ============================================================================
// NETWORK RATE CALCULATOR
// ============================================================================

use std::collections::BTreeMap;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::snapshot::round_to;
use crate::source::NetIoCounters;

/// Last observed counters per interface.
pub type NetworkCounterState = BTreeMap<CompactString, NetIoCounters>;

/// Upload/download derived from two consecutive samples of one interface.
/// Deltas are signed: a counter reset shows up as a negative value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateRecord {
    pub bytes_uploaded: i64,
    /// Bytes per second, two decimals
    pub upload_rate: f64,
    pub bytes_downloaded: i64,
    pub download_rate: f64,
}

/// Owns the previous network sample. Each instance is independent.
#[derive(Debug, Default)]
pub struct RateCalculator {
    previous: Option<NetworkCounterState>,
}

impl RateCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rates for every interface present in both the previous and `current`
    /// state, then `current` replaces the previous state wholesale.
    pub fn compute_rates(
        &mut self,
        current: &NetworkCounterState,
        interval_secs: f64,
    ) -> BTreeMap<CompactString, RateRecord> {
        let rates = match &self.previous {
            Some(previous) => current
                .iter()
                .filter_map(|(interface, now)| {
                    let before = previous.get(interface)?;
                    Some((interface.clone(), rate_between(before, now, interval_secs)))
                })
                .collect(),
            None => BTreeMap::new(),
        };

        trace!(
            target: "telemetry::rates",
            interfaces = current.len(),
            rated = rates.len(),
            "Network rates computed"
        );

        self.previous = Some(current.clone());
        rates
    }

    /// State the next call will compare against.
    pub fn previous(&self) -> Option<&NetworkCounterState> {
        self.previous.as_ref()
    }
}

fn rate_between(before: &NetIoCounters, now: &NetIoCounters, interval_secs: f64) -> RateRecord {
    let uploaded = delta(now.bytes_sent, before.bytes_sent);
    let downloaded = delta(now.bytes_recv, before.bytes_recv);
    RateRecord {
        bytes_uploaded: uploaded,
        upload_rate: per_second(uploaded, interval_secs),
        bytes_downloaded: downloaded,
        download_rate: per_second(downloaded, interval_secs),
    }
}

fn delta(now: u64, before: u64) -> i64 {
    (now as i128 - before as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn per_second(bytes: i64, interval_secs: f64) -> f64 {
    round_to(bytes as f64 / interval_secs, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state(entries: &[(&str, u64, u64)]) -> NetworkCounterState {
        entries
            .iter()
            .map(|(name, sent, recv)| {
                let io = NetIoCounters {
                    bytes_sent: *sent,
                    bytes_recv: *recv,
                    ..Default::default()
                };
                (CompactString::from(*name), io)
            })
            .collect()
    }

    #[test]
    fn test_first_sample_is_empty() {
        let mut calc = RateCalculator::new();
        let current = state(&[("eth0", 1000, 2000)]);

        assert!(calc.compute_rates(&current, 2.0).is_empty());
        assert_eq!(calc.previous(), Some(&current));
    }

    #[test]
    fn test_rate_arithmetic() {
        let mut calc = RateCalculator::new();
        calc.compute_rates(&state(&[("eth0", 1000, 2000)]), 2.0);
        let rates = calc.compute_rates(&state(&[("eth0", 1500, 2200)]), 2.0);

        assert_eq!(
            rates["eth0"],
            RateRecord {
                bytes_uploaded: 500,
                upload_rate: 250.0,
                bytes_downloaded: 200,
                download_rate: 100.0,
            }
        );
    }

    #[test]
    fn test_disappearing_and_new_interfaces_are_absent() {
        let mut calc = RateCalculator::new();
        calc.compute_rates(&state(&[("eth0", 10, 10), ("wlan0", 5, 5)]), 1.0);
        let rates = calc.compute_rates(&state(&[("eth0", 20, 30), ("docker0", 1, 1)]), 1.0);

        assert_eq!(rates.keys().map(|k| k.as_str()).collect::<Vec<_>>(), ["eth0"]);
        assert_eq!(rates["eth0"].bytes_downloaded, 20);
    }

    #[test]
    fn test_negative_delta_is_preserved() {
        let mut calc = RateCalculator::new();
        calc.compute_rates(&state(&[("eth0", 5000, 5000)]), 2.0);
        let rates = calc.compute_rates(&state(&[("eth0", 1000, 4999)]), 2.0);

        assert_eq!(rates["eth0"].bytes_uploaded, -4000);
        assert_eq!(rates["eth0"].upload_rate, -2000.0);
        assert_eq!(rates["eth0"].download_rate, -0.5);
    }

    #[test]
    fn test_empty_current_replaces_state() {
        let mut calc = RateCalculator::new();
        calc.compute_rates(&state(&[("eth0", 1, 1)]), 1.0);
        assert!(calc.compute_rates(&NetworkCounterState::new(), 1.0).is_empty());

        // eth0 comes back with no baseline.
        assert!(calc.compute_rates(&state(&[("eth0", 9, 9)]), 1.0).is_empty());
    }

    #[test]
    fn test_rates_round_to_two_decimals() {
        let mut calc = RateCalculator::new();
        calc.compute_rates(&state(&[("eth0", 0, 0)]), 3.0);
        let rates = calc.compute_rates(&state(&[("eth0", 100, 200)]), 3.0);

        assert_eq!(rates["eth0"].upload_rate, 33.33);
        assert_eq!(rates["eth0"].download_rate, 66.67);
    }

    #[test]
    fn test_instances_are_independent() {
        let mut a = RateCalculator::new();
        let mut b = RateCalculator::new();
        a.compute_rates(&state(&[("eth0", 1, 1)]), 1.0);

        assert!(b.compute_rates(&state(&[("eth0", 2, 2)]), 1.0).is_empty());
        assert_eq!(a.compute_rates(&state(&[("eth0", 3, 3)]), 1.0)["eth0"].bytes_uploaded, 2);
    }
}
