use serde::{Deserialize, Serialize};

/// Per-run energy deposit tally: count, sum and sum of squares (MeV, MeV²).
///
/// One accumulator belongs to exactly one execution context while events are
/// processed. Merging is plain addition, so worker tallies may be folded in any
/// order or grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAccumulator {
    events: u64,
    sum: f64,
    sum_sq: f64,
}

impl RunAccumulator {
    /// Empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events: 0,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    /// Builds an accumulator from raw totals.
    #[must_use]
    pub const fn from_parts(events: u64, sum: f64, sum_sq: f64) -> Self {
        Self {
            events,
            sum,
            sum_sq,
        }
    }

    /// Zeroes all totals at run start.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Records one scoring event.
    pub fn add_event(&mut self, energy_deposit: f64) {
        self.events += 1;
        self.sum += energy_deposit;
        self.sum_sq += energy_deposit * energy_deposit;
    }

    /// Folds another accumulator into this one.
    pub fn merge(&mut self, other: &Self) {
        self.events += other.events;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    /// Number of recorded events.
    #[must_use]
    pub const fn events(&self) -> u64 {
        self.events
    }

    /// Sum of deposits.
    #[must_use]
    pub const fn sum(&self) -> f64 {
        self.sum
    }

    /// Sum of squared deposits.
    #[must_use]
    pub const fn sum_sq(&self) -> f64 {
        self.sum_sq
    }

    /// Derived statistics, or `None` when no event was recorded.
    #[must_use]
    pub fn statistics(&self) -> Option<RunStatistics> {
        if self.events == 0 {
            return None;
        }
        let n = self.events as f64;
        let mean = self.sum / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        Some(RunStatistics {
            events: self.events,
            sum: self.sum,
            mean,
            variance,
            rms: variance.sqrt(),
        })
    }
}

impl FromIterator<f64> for RunAccumulator {
    fn from_iter<I: IntoIterator<Item = f64>>(deposits: I) -> Self {
        let mut acc = Self::new();
        deposits.into_iter().for_each(|edep| acc.add_event(edep));
        acc
    }
}

/// Mean, variance and rms of a non-empty run. Variance is clamped at zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Event count.
    pub events: u64,
    /// Total deposit.
    pub sum: f64,
    /// Mean deposit per event.
    pub mean: f64,
    /// `sumSq / N - mean²`, never negative.
    pub variance: f64,
    /// Square root of the variance.
    pub rms: f64,
}
