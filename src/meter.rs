use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::telegram::RawSample;

/// Per-channel accounting state. `total_pulses` never decreases for the
/// lifetime of the process; `link_epoch` counts inferred device resets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub last_raw: Option<u64>,
    pub total_pulses: u64,
    pub link_epoch: u32,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// One reconciled observation, ready for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub input: String,
    pub delta_pulses: u64,
    pub total_pulses: u64,
    pub link_epoch: u32,
    pub ts: DateTime<Utc>,
}

/// Folds raw device counters into running totals.
///
/// The device counter restarts at zero on power loss, and this process can
/// restart while the device keeps counting. Both hazards are handled from
/// the raw sequence alone: a first-ever sample anchors the counter without
/// inventing a delta, and a counter regression is read as a power-cycle
/// with `raw` itself being the count since reset.
pub struct Reconciler {
    channels: BTreeMap<String, ChannelState>,
}

impl Reconciler {
    /// Track the given inputs, seeded with their persisted totals. Samples
    /// for any other input are dropped.
    pub fn new(seed: impl IntoIterator<Item = (String, u64)>) -> Self {
        let channels = seed
            .into_iter()
            .map(|(input, total)| {
                (
                    input,
                    ChannelState {
                        total_pulses: total,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self { channels }
    }

    pub fn state(&self, input: &str) -> Option<&ChannelState> {
        self.channels.get(input)
    }

    /// Fold one raw sample into the channel state. Returns `None` for
    /// inputs that are not tracked.
    pub fn apply(&mut self, sample: &RawSample) -> Option<Reading> {
        let state = self.channels.get_mut(&sample.input)?;

        let delta = match state.last_raw {
            // First sample ever, or first after a link outage: the delta is
            // unknowable, anchor only.
            None => 0,
            Some(prev) if sample.raw >= prev => sample.raw - prev,
            Some(prev) => {
                // Counter went backward: the device power-cycled and has
                // been counting from zero since.
                warn!(
                    channel = %sample.input,
                    prev,
                    raw = sample.raw,
                    "counter regression; device power-cycle assumed"
                );
                state.link_epoch += 1;
                sample.raw
            }
        };

        state.total_pulses += delta;
        state.last_raw = Some(sample.raw);
        state.last_seen_at = Some(sample.ts);

        Some(Reading {
            input: sample.input.clone(),
            delta_pulses: delta,
            total_pulses: state.total_pulses,
            link_epoch: state.link_epoch,
            ts: sample.ts,
        })
    }

    /// Forget per-channel raw anchors after a link outage. The device may
    /// have power-cycled while we were deaf; the next sample per channel
    /// re-anchors with a zero delta.
    pub fn mark_link_down(&mut self) {
        for state in self.channels.values_mut() {
            state.last_raw = None;
        }
    }
}

/// Render a pulse count in physical units. All accounting stays in integer
/// pulses; this is the only place a scale factor is applied, by exact long
/// division. Exact whenever the factor divides a power of ten (1, 10, 1000,
/// 2000, ...); other factors truncate to three decimals.
pub fn format_scaled(pulses: u64, pulses_per_unit: u64) -> String {
    if pulses_per_unit <= 1 {
        return pulses.to_string();
    }
    let whole = pulses / pulses_per_unit;
    let rem = pulses % pulses_per_unit;
    let mut digits = 3u32;
    for d in 1..=9 {
        if 10u128.pow(d) % pulses_per_unit as u128 == 0 {
            digits = d;
            break;
        }
    }
    let frac = rem as u128 * 10u128.pow(digits) / pulses_per_unit as u128;
    format!("{whole}.{frac:0width$}", width = digits as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::RawSample;
    use pretty_assertions::assert_eq;

    fn sample(input: &str, raw: u64) -> RawSample {
        RawSample {
            input: input.to_string(),
            raw,
            ts: Utc::now(),
        }
    }

    fn single(seed: u64) -> Reconciler {
        Reconciler::new([("M1".to_string(), seed)])
    }

    #[test]
    fn first_sample_anchors_without_delta() {
        let mut r = single(1000);
        let reading = r.apply(&sample("M1", 5)).unwrap();
        assert_eq!(reading.delta_pulses, 0);
        assert_eq!(reading.total_pulses, 1000);
        assert_eq!(reading.link_epoch, 0);
    }

    #[test]
    fn regression_counts_from_reset() {
        // seeded 1000, raws 5, 12, 3 (reset), 9
        let mut r = single(1000);
        let deltas: Vec<u64> = [5u64, 12, 3, 9]
            .iter()
            .map(|&raw| r.apply(&sample("M1", raw)).unwrap().delta_pulses)
            .collect();
        assert_eq!(deltas, vec![0, 7, 3, 6]);
        let state = r.state("M1").unwrap();
        assert_eq!(state.total_pulses, 1016);
        assert_eq!(state.link_epoch, 1);
    }

    #[test]
    fn totals_accumulate_over_seed() {
        let mut r = single(500);
        for raw in [10u64, 20, 35] {
            r.apply(&sample("M1", raw));
        }
        assert_eq!(r.state("M1").unwrap().total_pulses, 500 + 25);
    }

    #[test]
    fn epoch_increments_once_per_regression() {
        let mut r = single(0);
        for raw in [100u64, 2, 5, 9] {
            r.apply(&sample("M1", raw));
        }
        assert_eq!(r.state("M1").unwrap().link_epoch, 1);
        r.apply(&sample("M1", 1));
        assert_eq!(r.state("M1").unwrap().link_epoch, 2);
    }

    #[test]
    fn totals_never_regress() {
        let mut r = single(0);
        let mut last_total = 0;
        for raw in [3u64, 9, 2, 2, 11, 0, 4] {
            let reading = r.apply(&sample("M1", raw)).unwrap();
            assert!(reading.total_pulses >= last_total);
            last_total = reading.total_pulses;
        }
    }

    #[test]
    fn zero_delta_is_still_a_reading() {
        let mut r = single(0);
        r.apply(&sample("M1", 7));
        let reading = r.apply(&sample("M1", 7)).unwrap();
        assert_eq!(reading.delta_pulses, 0);
    }

    #[test]
    fn untracked_inputs_are_dropped() {
        let mut r = single(0);
        assert!(r.apply(&sample("M2", 42)).is_none());
        assert!(r.state("M2").is_none());
    }

    #[test]
    fn link_down_reanchors_without_delta() {
        let mut r = single(0);
        r.apply(&sample("M1", 100));
        r.mark_link_down();
        // device kept counting during the outage; that gap is unknowable
        let reading = r.apply(&sample("M1", 150)).unwrap();
        assert_eq!(reading.delta_pulses, 0);
        assert_eq!(reading.link_epoch, 0);
        // deltas resume from the new anchor
        let reading = r.apply(&sample("M1", 155)).unwrap();
        assert_eq!(reading.delta_pulses, 5);
    }

    #[test]
    fn format_scaled_power_of_ten() {
        assert_eq!(format_scaled(770123, 1000), "770.123");
        assert_eq!(format_scaled(5, 1000), "0.005");
        assert_eq!(format_scaled(42, 1), "42");
        assert_eq!(format_scaled(0, 1000), "0.000");
        assert_eq!(format_scaled(123, 10), "12.3");
    }

    #[test]
    fn format_scaled_two_five_factors_stay_exact() {
        // 2000 divides 10^4
        assert_eq!(format_scaled(3, 2000), "0.0015");
        assert_eq!(format_scaled(2500, 2000), "1.2500");
    }

    #[test]
    fn format_scaled_awkward_factor_truncates() {
        assert_eq!(format_scaled(1, 3), "0.333");
    }
}
