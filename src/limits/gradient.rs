use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::{limits::Sample, moving_avg::MinimumMeasurement, Outcome};

use super::{defaults::MIN_SAMPLE_LATENCY, LimitAlgorithm};

/// Delay-based congestion avoidance using a periodically re-measured no-load baseline.
///
/// Tracks the lowest observed latency (`rtt_no_load`) and compares it against each new sample to
/// estimate how much queueing is occurring. Unlike [`super::Gradient2`]'s long-running average,
/// the baseline here is a running minimum which is deliberately forgotten and re-measured every
/// so often (a "probe"), so that a baseline latency inflated by a long period of sustained load
/// doesn't stick around forever.
///
/// Inspired by TCP congestion control algorithms using delay gradients.
///
/// - [Revisiting TCP Congestion Control Using Delay Gradients](https://hal.science/hal-01597987/)
pub struct Gradient {
    min_limit: usize,
    max_limit: usize,

    tolerance: f64,
    smoothing: f64,
    backoff_ratio: f64,
    probe_interval: u32,
    queue_size_fn: Box<dyn (Fn(usize) -> usize) + Send + Sync>,

    limit: AtomicUsize,
    inner: Mutex<Inner>,
}

struct Inner {
    rtt_no_load: MinimumMeasurement,
    samples_until_probe: u32,
    rng: SmallRng,
}

impl Gradient {
    const DEFAULT_MIN_LIMIT: usize = 1;
    const DEFAULT_MAX_LIMIT: usize = 1000;

    const DEFAULT_TOLERANCE: f64 = 2.0;
    const DEFAULT_SMOOTHING: f64 = 0.2;
    const DEFAULT_BACKOFF_RATIO: f64 = 0.9;
    const DEFAULT_PROBE_INTERVAL: u32 = 1000;

    /// Create a new gradient limiter, starting at `initial_limit`.
    pub fn new(initial_limit: usize) -> Self {
        assert!(initial_limit > 0);

        let mut rng = SmallRng::from_entropy();
        let samples_until_probe = rng.gen_range(Self::DEFAULT_PROBE_INTERVAL..=2 * Self::DEFAULT_PROBE_INTERVAL);

        Self {
            min_limit: Self::DEFAULT_MIN_LIMIT,
            max_limit: Self::DEFAULT_MAX_LIMIT,

            tolerance: Self::DEFAULT_TOLERANCE,
            smoothing: Self::DEFAULT_SMOOTHING,
            backoff_ratio: Self::DEFAULT_BACKOFF_RATIO,
            probe_interval: Self::DEFAULT_PROBE_INTERVAL,
            queue_size_fn: Box::new(default_queue_size),

            limit: AtomicUsize::new(initial_limit),
            inner: Mutex::new(Inner {
                rtt_no_load: MinimumMeasurement::new(),
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

    /// How much latency inflation (relative to the no-load baseline) to tolerate before shrinking
    /// the limit. Must be `>= 1.0`.
    pub fn with_tolerance(self, tolerance: f64) -> Self {
        assert!(tolerance >= 1.0);
        Self { tolerance, ..self }
    }

    /// The EMA weight given to a newly computed limit when it's below the current limit.
    pub fn with_smoothing(self, smoothing: f64) -> Self {
        assert!((0.0..=1.0).contains(&smoothing));
        Self { smoothing, ..self }
    }

    /// The multiplicative factor applied to the limit when an [Outcome::Overload] is observed.
    pub fn with_backoff_ratio(self, ratio: f64) -> Self {
        assert!((0.5..1.0).contains(&ratio));
        Self {
            backoff_ratio: ratio,
            ..self
        }
    }

    /// The (approximate) number of samples between baseline re-measurements.
    ///
    /// The actual gap is jittered, uniformly drawn from `probe_interval..2*probe_interval`, to
    /// avoid every instance of a shared algorithm probing in lockstep.
    pub fn with_probe_interval(self, samples: u32) -> Self {
        assert!(samples > 0);
        Self {
            probe_interval: samples,
            ..self
        }
    }

    /// Override how much headroom (in units of concurrency) is reserved for queueing at a given
    /// limit. Defaults to `max(4, ceil(sqrt(limit)))`.
    pub fn with_queue_size(self, f: impl (Fn(usize) -> usize) + Send + Sync + 'static) -> Self {
        Self {
            queue_size_fn: Box::new(f),
            ..self
        }
    }

    fn queue_size(&self, limit: usize) -> usize {
        (self.queue_size_fn)(limit)
    }
}

fn default_queue_size(limit: usize) -> usize {
    ((limit as f64).sqrt().ceil() as usize).max(4)
}

#[async_trait]
impl LimitAlgorithm for Gradient {
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
            inner.samples_until_probe = inner
                .rng
                .gen_range(self.probe_interval..=2 * self.probe_interval);
            inner.rtt_no_load.reset();
            inner.rtt_no_load.add(sample.latency.as_secs_f64());

            let forced = self.queue_size(old_limit).max(self.min_limit).min(self.max_limit);
            self.limit.store(forced, Ordering::Release);
            return forced;
        }

        inner.rtt_no_load.add(sample.latency.as_secs_f64());
        let rtt_no_load = inner.rtt_no_load.get().unwrap_or(sample.latency.as_secs_f64());

        if (sample.in_flight as f64) < old_limit as f64 / 2.0 {
            return old_limit;
        }

        let gradient = (self.tolerance * rtt_no_load / sample.latency.as_secs_f64()).clamp(0.5, 1.0);

        let mut new_limit = if sample.outcome == Outcome::Overload {
            old_limit as f64 * self.backoff_ratio
        } else {
            old_limit as f64 * gradient + self.queue_size(old_limit) as f64
        };

        if new_limit < old_limit as f64 {
            new_limit = ((1.0 - self.smoothing) * old_limit as f64 + self.smoothing * new_limit)
                .max(self.min_limit as f64);
        }

        let floor = self.queue_size(old_limit).max(self.min_limit) as f64;
        let clamped = new_limit.clamp(floor, self.max_limit as f64) as usize;

        self.limit.store(clamped, Ordering::Release);
        clamped
    }
}

impl std::fmt::Debug for Gradient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gradient")
            .field("limit", &self.limit)
            .field("min_limit", &self.min_limit)
            .field("max_limit", &self.max_limit)
            .field("tolerance", &self.tolerance)
            .field("smoothing", &self.smoothing)
            .field("backoff_ratio", &self.backoff_ratio)
            .field("probe_interval", &self.probe_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{DefaultLimiter, Limiter, Outcome};

    use super::*;

    fn sample(latency_ms: u64, in_flight: usize, outcome: Outcome) -> Sample {
        Sample {
            latency: Duration::from_millis(latency_ms),
            in_flight,
            outcome,
        }
    }

    #[tokio::test]
    async fn app_limited_samples_do_not_change_the_limit() {
        let gradient = Gradient::new(50).with_probe_interval(1_000_000);

        let limit = gradient.update(sample(10, 5, Outcome::Success)).await;
        assert_eq!(limit, 50, "in_flight well below half the limit: app-limited");
    }

    #[tokio::test]
    async fn increased_latency_shrinks_the_limit() {
        let gradient = Gradient::new(50).with_probe_interval(1_000_000);

        gradient.update(sample(10, 40, Outcome::Success)).await;
        let limit = gradient.update(sample(20, 40, Outcome::Success)).await;

        assert!(limit < 50, "doubled latency should shrink the limit, got {limit}");
    }

    #[tokio::test]
    async fn overload_backs_off_multiplicatively() {
        let gradient = Gradient::new(50).with_probe_interval(1_000_000);

        let limit = gradient.update(sample(10, 40, Outcome::Overload)).await;
        assert!(limit < 50);
    }

    #[tokio::test]
    async fn it_works_end_to_end() {
        static INIT_LIMIT: usize = 50;
        let gradient = Gradient::new(INIT_LIMIT).with_probe_interval(1_000_000);

        let limiter = DefaultLimiter::new(gradient);

        let mut tokens = Vec::with_capacity(40);
        for _ in 0..40 {
            let token = limiter.try_acquire().await.unwrap();
            tokens.push(token);
        }
        for mut token in tokens {
            token.set_latency(Duration::from_millis(10));
            limiter.release(token, Some(Outcome::Success)).await;
        }

        let mut tokens = Vec::with_capacity(40);
        for _ in 0..40 {
            let mut token = limiter.try_acquire().await.unwrap();
            token.set_latency(Duration::from_millis(40));
            tokens.push(token);
        }
        for token in tokens {
            limiter.release(token, Some(Outcome::Success)).await;
        }

        assert!(
            limiter.limit() < INIT_LIMIT,
            "sustained latency increase should shrink the limit"
        );
    }
}
