//! Moving averages and running minima over numeric samples.

use std::{collections::VecDeque, time::Duration};

/// An [exponential moving average](https://en.wikipedia.org/wiki/Exponential_smoothing).
pub struct ExpSmoothed {
    /// Smoothing factor `Î±`. Weighting for the previous duration in the window.
    ///
    /// 0 < `a` < 1
    smoothing_factor: f64,

    value: Duration,

    // For initial warmup period
    initial_sum: Duration,
    initial_count: u16,
}

impl ExpSmoothed {
    /// > Exponential smoothing puts substantial weight on past observations, so the initial value
    /// > of demand will have an unreasonably large effect on early forecasts. This problem can be
    /// > overcome by allowing the process to evolve for a reasonable number of periods (10 or more)
    /// > and using the average of the demand during those periods as the initial forecast.
    /// >
    /// > [Source](https://en.wikipedia.org/wiki/Exponential_smoothing#Choosing_the_initial_smoothed_value)
    const INITIAL_WARMUP_SAMPLES: u16 = 10;

    pub fn new_with_window_size(k: u16) -> Self {
        Self {
            smoothing_factor: Self::smoothing_for_window(k),
            value: Duration::ZERO,
            initial_sum: Duration::ZERO,
            initial_count: 0,
        }
    }

    pub fn sample(&mut self, sample: Duration) -> Duration {
        if self.initial_count < Self::INITIAL_WARMUP_SAMPLES {
            self.initial_sum += sample;
            self.initial_count += 1;

            self.value = self.initial_sum / self.initial_count.into();
        } else {
            // Signed delta, since `sample` can be smaller than `self.value` and `Duration`
            // subtraction would otherwise panic on underflow.
            let delta = sample.as_secs_f64() - self.value.as_secs_f64();
            self.value = Duration::from_secs_f64(
                (self.value.as_secs_f64() + delta * self.smoothing_factor).max(0.0),
            );
        }
        self.value
    }

    pub fn value(&self) -> Duration {
        self.value
    }

    pub fn set(&mut self, value: Duration) {
        self.value = value;
    }

    fn smoothing_for_window(k: u16) -> f64 {
        assert!(k > 0, "window size must be > 0");
        assert!(k < u16::MAX, "window size mustn't overflow");

        2.0 / ((k + 1) as f64)
    }
}

/// A [simple moving average](https://en.wikipedia.org/wiki/Moving_average#Simple_moving_average).
pub struct Simple {
    window_size: u16,

    values: VecDeque<Duration>,
    avg: Duration,
}

impl Simple {
    pub fn new_with_window_size(window_size: u16) -> Self {
        assert!(window_size > 0, "window size must be > 0");
        Self {
            window_size,

            values: VecDeque::with_capacity(window_size.into()),
            avg: Duration::ZERO,
        }
    }

    pub fn sample(&mut self, sample: Duration) -> Duration {
        // Safety: length is constrained to u16.
        let count: u32 = self.values.len() as u32;

        if count >= self.window_size.into() {
            let prev = self.values.pop_front().expect("should be non-empty");
            self.avg += (sample - prev) / count;
        } else {
            self.avg = (sample + (count * self.avg)) / (count + 1);
        };

        self.values.push_back(sample);

        self.avg
    }
}

/// Tracks a running minimum over a stream of `f64` samples.
///
/// `add` only ever lowers the tracked value; `update_with` lets a caller replace it with an
/// arbitrary function of the current value, used by [`crate::limits::Gradient`] to reset its
/// baseline after a probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinimumMeasurement {
    value: Option<f64>,
}

impl MinimumMeasurement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `sample` into the running minimum. Returns `true` iff the tracked value changed.
    pub fn add(&mut self, sample: f64) -> bool {
        match self.value {
            None => {
                self.value = Some(sample);
                true
            }
            Some(current) if sample < current => {
                self.value = Some(sample);
                true
            }
            Some(_) => false,
        }
    }

    /// Unconditionally replaces the tracked value with `f(current)`.
    ///
    /// If no value has been observed yet, `current` is `0.0`.
    pub fn update_with(&mut self, f: impl FnOnce(f64) -> f64) {
        self.value = Some(f(self.value.unwrap_or(0.0)));
    }

    pub fn get(&self) -> Option<f64> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod measurement_tests {
    use super::*;

    #[test]
    fn minimum_tracks_lowest_value() {
        let mut m = MinimumMeasurement::new();
        assert!(m.add(5.0));
        assert!(!m.add(7.0));
        assert!(m.add(3.0));
        assert_eq!(m.get(), Some(3.0));
    }

    #[test]
    fn minimum_update_with_replaces_unconditionally() {
        let mut m = MinimumMeasurement::new();
        m.add(5.0);
        m.update_with(|v| v * 2.0);
        assert_eq!(m.get(), Some(10.0));
    }

    #[test]
    fn minimum_reset_forgets_value() {
        let mut m = MinimumMeasurement::new();
        m.add(5.0);
        m.reset();
        assert_eq!(m.get(), None);
    }
}
