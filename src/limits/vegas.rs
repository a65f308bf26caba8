use std::{
    fmt::Debug,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::Outcome;

use super::{defaults::MIN_SAMPLE_LATENCY, LimitAlgorithm, Sample};

/// Delay-based congestion avoidance, estimating the number of queued jobs from the gap between a
/// sample's latency and a periodically re-measured no-load baseline.
///
/// Unlike [`super::Gradient`], which folds the baseline comparison into a single continuous
/// `gradient` multiplier, Vegas buckets the estimated queue size against `alpha`/`beta` thresholds
/// and nudges the limit by a fixed increment/decrement each sample.
///
/// Inspired by TCP Vegas.
///
/// - [TCP Vegas: End to End Congestion Avoidance on a Global
///   Internet](https://www.cs.princeton.edu/courses/archive/fall06/cos561/papers/vegas.pdf)
/// - [Understanding TCP Vegas: Theory and
///   Practice](https://www.cs.princeton.edu/research/techreps/TR-628-00)
pub struct Vegas {
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,
    probe_multiplier: u32,

    /// Lower queueing threshold, as a function of the current limit.
    alpha: Box<dyn (Fn(usize) -> f64) + Send + Sync>,
    /// Upper queueing threshold, as a function of the current limit.
    beta: Box<dyn (Fn(usize) -> f64) + Send + Sync>,
    /// Queueing threshold below which the limit is grown by `beta`, not just `increase`.
    threshold: Box<dyn (Fn(usize) -> f64) + Send + Sync>,
    /// Limit to use when queueing is low.
    increase: Box<dyn (Fn(usize) -> usize) + Send + Sync>,
    /// Limit to use when queueing is high, or on overload.
    decrease: Box<dyn (Fn(usize) -> usize) + Send + Sync>,

    limit: AtomicUsize,
    inner: Mutex<Inner>,
}

struct Inner {
    /// The minimum observed latency, used as a baseline. `None` until the first sample or probe.
    rtt_no_load: Option<Duration>,
    samples_until_probe: u32,
    rng: SmallRng,
}

impl Vegas {
    const DEFAULT_MIN_LIMIT: usize = 1;
    const DEFAULT_MAX_LIMIT: usize = 1000;

    const DEFAULT_ALPHA_MULTIPLIER: f64 = 3_f64;
    const DEFAULT_BETA_MULTIPLIER: f64 = 6_f64;

    /// By default the limit is adopted without smoothing.
    const DEFAULT_SMOOTHING: f64 = 1.0;

    /// The baseline is re-probed roughly every `probe_multiplier * limit` samples.
    const DEFAULT_PROBE_MULTIPLIER: u32 = 30;

    /// Create a new Vegas limiter, starting at `initial_limit`.
    pub fn new(initial_limit: usize) -> Self {
        assert!(initial_limit > 0);

        let mut rng = SmallRng::from_entropy();
        let samples_until_probe =
            next_probe_threshold(&mut rng, Self::DEFAULT_PROBE_MULTIPLIER, initial_limit);

        Self {
            limit: AtomicUsize::new(initial_limit),
            min_limit: Self::DEFAULT_MIN_LIMIT,
            max_limit: Self::DEFAULT_MAX_LIMIT,
            smoothing: Self::DEFAULT_SMOOTHING,
            probe_multiplier: Self::DEFAULT_PROBE_MULTIPLIER,

            alpha: Box::new(|limit| {
                Self::DEFAULT_ALPHA_MULTIPLIER * (limit as f64).log10().max(1_f64)
            }),
            beta: Box::new(|limit| {
                Self::DEFAULT_BETA_MULTIPLIER * (limit as f64).log10().max(1_f64)
            }),
            threshold: Box::new(|limit| (limit as f64).log10().max(1_f64)),
            increase: Box::new(|limit| limit + (limit as f64).log10().max(1_f64) as usize),
            decrease: Box::new(|limit| {
                limit.saturating_sub((limit as f64).log10().max(1_f64) as usize)
            }),

            inner: Mutex::new(Inner {
                rtt_no_load: None,
                samples_until_probe,
                rng,
            }),
        }
    }

    /// The smallest limit this algorithm will settle on.
    pub fn with_min_limit(self, min: usize) -> Self {
        assert!(min > 0);
        Self {
            min_limit: min,
            ..self
        }
    }

    /// The largest limit this algorithm will settle on.
    pub fn with_max_limit(self, max: usize) -> Self {
        assert!(max > 0);
        Self {
            max_limit: max,
            ..self
        }
    }

    /// The EMA weight given to a newly computed limit. `1.0` (the default) adopts it outright.
    pub fn with_smoothing(self, smoothing: f64) -> Self {
        assert!((0.0..=1.0).contains(&smoothing));
        Self { smoothing, ..self }
    }

    /// The (approximate) multiplier, against the current limit, of samples between baseline
    /// re-measurements. The actual gap is jittered, uniformly drawn from `limit*m..2*limit*m`.
    pub fn with_probe_multiplier(self, multiplier: u32) -> Self {
        assert!(multiplier > 0);
        Self {
            probe_multiplier: multiplier,
            ..self
        }
    }

    /// Override the lower queueing threshold function.
    pub fn with_alpha(self, alpha: impl (Fn(usize) -> f64) + Send + Sync + 'static) -> Self {
        Self {
            alpha: Box::new(alpha),
            ..self
        }
    }

    /// Override the upper queueing threshold function.
    pub fn with_beta(self, beta: impl (Fn(usize) -> f64) + Send + Sync + 'static) -> Self {
        Self {
            beta: Box::new(beta),
            ..self
        }
    }

    /// Override the threshold below which the limit grows by `beta` rather than `increase`.
    pub fn with_threshold(self, threshold: impl (Fn(usize) -> f64) + Send + Sync + 'static) -> Self {
        Self {
            threshold: Box::new(threshold),
            ..self
        }
    }

    /// Override the function used to grow the limit when queueing is low.
    pub fn with_increase(self, increase: impl (Fn(usize) -> usize) + Send + Sync + 'static) -> Self {
        Self {
            increase: Box::new(increase),
            ..self
        }
    }

    /// Override the function used to shrink the limit when queueing is high or overload occurs.
    pub fn with_decrease(self, decrease: impl (Fn(usize) -> usize) + Send + Sync + 'static) -> Self {
        Self {
            decrease: Box::new(decrease),
            ..self
        }
    }
}

fn next_probe_threshold(rng: &mut SmallRng, probe_multiplier: u32, limit: usize) -> u32 {
    let base = probe_multiplier.saturating_mul(limit.max(1) as u32).max(1);
    rng.gen_range(base..=2 * base)
}

#[async_trait]
impl LimitAlgorithm for Vegas {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    async fn update(&self, sample: Sample) -> usize {
        if sample.latency < MIN_SAMPLE_LATENCY {
            return self.limit.load(Ordering::Acquire);
        }

        let mut inner = self.inner.lock().await;
        let old_limit = self.limit.load(Ordering::Acquire);

        inner.samples_until_probe = inner.samples_until_probe.saturating_sub(1);
        if inner.samples_until_probe == 0 {
            inner.samples_until_probe =
                next_probe_threshold(&mut inner.rng, self.probe_multiplier, old_limit);
            inner.rtt_no_load = Some(sample.latency);
            return old_limit;
        }

        let rtt_no_load = match inner.rtt_no_load {
            None => {
                inner.rtt_no_load = Some(sample.latency);
                return old_limit;
            }
            Some(baseline) if sample.latency < baseline => {
                inner.rtt_no_load = Some(sample.latency);
                return old_limit;
            }
            Some(baseline) => baseline,
        };

        let queue_size = (old_limit as f64
            * (1.0 - rtt_no_load.as_secs_f64() / sample.latency.as_secs_f64()))
        .ceil();

        let new_limit = if sample.outcome == Outcome::Overload {
            (self.decrease)(old_limit)
        } else if sample.in_flight * 2 < old_limit {
            return old_limit;
        } else if queue_size <= (self.threshold)(old_limit) {
            old_limit + (self.beta)(old_limit).round() as usize
        } else if queue_size < (self.alpha)(old_limit) {
            (self.increase)(old_limit)
        } else if queue_size > (self.beta)(old_limit) {
            (self.decrease)(old_limit)
        } else {
            old_limit
        };

        let new_limit = new_limit.clamp(self.min_limit, self.max_limit) as f64;
        let smoothed =
            ((1.0 - self.smoothing) * old_limit as f64 + self.smoothing * new_limit).round();
        let clamped = (smoothed as usize).clamp(self.min_limit, self.max_limit);

        self.limit.store(clamped, Ordering::Release);
        clamped
    }
}

impl Debug for Vegas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vegas")
            .field("limit", &self.limit)
            .field("min_limit", &self.min_limit)
            .field("max_limit", &self.max_limit)
            .field("smoothing", &self.smoothing)
            .field("probe_multiplier", &self.probe_multiplier)
            .field("alpha(1)", &(self.alpha)(1))
            .field("beta(1)", &(self.beta)(1))
            .finish()
    }
}
