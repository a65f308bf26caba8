//! Sample aggregators: fold several raw samples into one before an algorithm ever sees them.
//!
//! Each call to [`Aggregator::sample`] returns a fresh, complete view of the aggregate so far —
//! the aggregator never mutates a previously returned [`Sample`] in place.

use std::time::Duration;

use crate::{limits::Sample, Outcome};

/// Folds a batch of samples into a single tracked sample.
///
/// `in_flight` and `outcome` are always the batch's maximum in-flight and worst outcome seen so
/// far; only the latency statistic differs between implementations.
pub trait Aggregator {
    /// Fold `sample` into the running aggregate, returning the aggregate's current state.
    fn sample(&mut self, sample: Sample) -> Sample;

    /// How many samples have been folded in since the last [`Aggregator::reset`].
    fn sample_size(&self) -> usize;

    /// Clear the aggregate back to empty.
    fn reset(&mut self);
}

/// Tracks the mean latency across the batch.
pub struct Average {
    latency_sum: Duration,
    max_in_flight: usize,
    worst_outcome: Outcome,
    samples: usize,
}

impl Default for Average {
    fn default() -> Self {
        Self {
            latency_sum: Duration::ZERO,
            max_in_flight: 0,
            worst_outcome: Outcome::Success,
            samples: 0,
        }
    }
}

impl Aggregator for Average {
    fn sample(&mut self, sample: Sample) -> Sample {
        self.latency_sum += sample.latency;
        self.max_in_flight = self.max_in_flight.max(sample.in_flight);
        self.worst_outcome = self.worst_outcome.overloaded_or(sample.outcome);
        self.samples += 1;

        Sample {
            in_flight: self.max_in_flight,
            latency: self.latency_sum.div_f64(self.samples as f64),
            outcome: self.worst_outcome,
        }
    }

    fn sample_size(&self) -> usize {
        self.samples
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Tracks a latency percentile across the batch, by keeping every observed latency and ranking
/// them on each call.
///
/// The tracked index is `round(n · percentile)`, clamped to at least the first element — not
/// `ceil`, which would bias every fractional rank upward instead of to the nearest one.
pub struct Percentile {
    percentile: f64,
    max_in_flight: usize,
    worst_outcome: Outcome,
    observed: Vec<Duration>,
}

impl Default for Percentile {
    fn default() -> Self {
        Self {
            percentile: 0.5,
            observed: Vec::new(),
            max_in_flight: 0,
            worst_outcome: Outcome::Success,
        }
    }
}

impl Percentile {
    /// Track the given `percentile`, which must be strictly between 0 and 1.
    pub fn new(percentile: f64) -> Self {
        assert!(
            percentile > 0. && percentile < 1.,
            "percentiles must be between 0 and 1 exclusive"
        );
        Self {
            percentile,
            ..Default::default()
        }
    }

    fn rank(&self) -> usize {
        ((self.observed.len() as f64 * self.percentile).round() as usize).max(1)
    }
}

impl Aggregator for Percentile {
    fn sample(&mut self, sample: Sample) -> Sample {
        self.observed.push(sample.latency);
        self.max_in_flight = self.max_in_flight.max(sample.in_flight);
        self.worst_outcome = self.worst_outcome.overloaded_or(sample.outcome);

        let mut sorted = self.observed.clone();
        sorted.sort_unstable();
        let index = self.rank() - 1;

        Sample {
            in_flight: self.max_in_flight,
            latency: sorted[index],
            outcome: self.worst_outcome,
        }
    }

    fn sample_size(&self) -> usize {
        self.observed.len()
    }

    fn reset(&mut self) {
        *self = Self {
            percentile: self.percentile,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(in_flight: usize, latency_ms: u64, outcome: Outcome) -> Sample {
        Sample {
            in_flight,
            latency: Duration::from_millis(latency_ms),
            outcome,
        }
    }

    #[tokio::test]
    async fn average_tracks_the_mean_max_in_flight_and_worst_outcome() {
        let mut aggregator = Average::default();

        aggregator.sample(sample(1, 1, Outcome::Success));
        aggregator.sample(sample(5, 3, Outcome::Overload));
        let tracked = aggregator.sample(sample(3, 5, Outcome::Success));

        assert_eq!(
            tracked,
            sample(5, 3, Outcome::Overload),
            "latency should be the mean of 1, 3, 5"
        );
        assert_eq!(aggregator.sample_size(), 3);
    }

    #[tokio::test]
    async fn average_reset_drops_prior_samples() {
        let mut aggregator = Average::default();
        aggregator.sample(sample(1, 1, Outcome::Success));
        aggregator.reset();

        let tracked = aggregator.sample(sample(3, 5, Outcome::Success));

        assert_eq!(tracked, sample(3, 5, Outcome::Success));
        assert_eq!(aggregator.sample_size(), 1);
    }

    #[tokio::test]
    async fn percentile_rank_uses_round_not_ceil() {
        // round(3 * 0.5) = 2, so the tracked index is 1 (0-based) — the middle of [1, 3, 5] once
        // sorted, not the element ceil would have picked.
        let mut aggregator = Percentile::new(0.5);

        aggregator.sample(sample(1, 1, Outcome::Success));
        aggregator.sample(sample(5, 5, Outcome::Success));
        let tracked = aggregator.sample(sample(3, 3, Outcome::Success));

        assert_eq!(tracked.latency, Duration::from_millis(3));
    }

    #[tokio::test]
    async fn low_percentile_clamps_to_the_smallest_observed_latency() {
        let mut aggregator = Percentile::new(0.01);

        aggregator.sample(sample(1, 1, Outcome::Success));
        aggregator.sample(sample(5, 3, Outcome::Overload));
        let tracked = aggregator.sample(sample(3, 5, Outcome::Success));

        assert_eq!(
            tracked,
            sample(5, 1, Outcome::Overload),
            "round(3 * 0.01) rounds down to 0, clamped up to the first rank"
        );
    }

    #[tokio::test]
    async fn high_percentile_tracks_the_largest_observed_latency() {
        let mut aggregator = Percentile::new(0.99);

        aggregator.sample(sample(1, 1, Outcome::Success));
        aggregator.sample(sample(5, 3, Outcome::Overload));
        let tracked = aggregator.sample(sample(3, 5, Outcome::Success));

        assert_eq!(tracked, sample(5, 5, Outcome::Overload));
    }

    #[tokio::test]
    async fn percentile_reset_drops_prior_samples_but_keeps_the_percentile() {
        let mut aggregator = Percentile::new(0.99);
        aggregator.sample(sample(1, 1, Outcome::Success));
        aggregator.reset();

        let tracked = aggregator.sample(sample(3, 5, Outcome::Success));

        assert_eq!(tracked, sample(3, 5, Outcome::Success));
        assert_eq!(aggregator.percentile, 0.99);
    }
}
