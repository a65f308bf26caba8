use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{limits::Sample, moving_avg};

use super::{defaults::MIN_SAMPLE_LATENCY, LimitAlgorithm};

/// Delay-based congestion avoidance based on change in average latency.
///
/// Considers the difference between a long-running average latency and the latest sample.
/// A change in this gradient is considered an indicator of a change in load on the system.
///
/// Wrap with a [`crate::limits::Windowed`] to control the short time window, otherwise the latest
/// sample is used directly.
///
/// Inspired by TCP congestion control algorithms using delay gradients.
///
/// - [Revisiting TCP Congestion Control Using Delay Gradients](https://hal.science/hal-01597987/)
pub struct Gradient2 {
    min_limit: usize,
    max_limit: usize,

    tolerance: f64,
    smoothing: f64,
    queue_size_fn: Box<dyn (Fn(usize) -> usize) + Send + Sync>,

    limit: AtomicUsize,
    inner: Mutex<Inner>,
}

struct Inner {
    long_window_latency: moving_avg::ExpSmoothed,
    limit: f64,
}

impl Gradient2 {
    const DEFAULT_MIN_LIMIT: usize = 1;
    const DEFAULT_MAX_LIMIT: usize = 1000;

    const DEFAULT_TOLERANCE: f64 = 2.0;
    const DEFAULT_SMOOTHING: f64 = 0.2;

    const DEFAULT_LONG_WINDOW_SAMPLES: u16 = 500;

    /// Create a new gradient limiter, starting at `initial_limit`.
    pub fn new(initial_limit: usize) -> Self {
        assert!(initial_limit > 0);

        Self {
            min_limit: Self::DEFAULT_MIN_LIMIT,
            max_limit: Self::DEFAULT_MAX_LIMIT,

            tolerance: Self::DEFAULT_TOLERANCE,
            smoothing: Self::DEFAULT_SMOOTHING,
            queue_size_fn: Box::new(default_queue_size),

            limit: AtomicUsize::new(initial_limit),
            inner: Mutex::new(Inner {
                long_window_latency: moving_avg::ExpSmoothed::new_with_window_size(
                    Self::DEFAULT_LONG_WINDOW_SAMPLES,
                ),
                limit: initial_limit as f64,
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

    /// How much latency inflation (relative to the long-running average) to tolerate before
    /// shrinking the limit. Must be `>= 1.0`.
    pub fn with_tolerance(self, tolerance: f64) -> Self {
        assert!(tolerance >= 1.0);
        Self { tolerance, ..self }
    }

    /// The EMA weight given to a newly computed limit each sample.
    pub fn with_smoothing(self, smoothing: f64) -> Self {
        assert!((0.0..=1.0).contains(&smoothing));
        Self { smoothing, ..self }
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
impl LimitAlgorithm for Gradient2 {
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    async fn update(&self, sample: Sample) -> usize {
        if sample.latency < MIN_SAMPLE_LATENCY {
            return self.limit.load(Ordering::Acquire);
        }

        let mut inner = self.inner.lock().await;

        let long = inner.long_window_latency.sample(sample.latency);

        let ratio = long.as_secs_f64() / sample.latency.as_secs_f64();

        // Speed up return to baseline after a long period of increased load.
        if ratio > 2.0 {
            inner.long_window_latency.set(long.mul_f64(0.95));
        }

        let old_limit = inner.limit;

        if (sample.in_flight as f64) < old_limit / 2.0 {
            return old_limit as usize;
        }

        // Only apply downwards gradient (when latency has increased).
        // Limit to >= 0.5 to prevent aggressive load shedding.
        let gradient = (self.tolerance * ratio).clamp(0.5, 1.0);

        let new_limit = old_limit * gradient + self.queue_size(old_limit as usize) as f64;

        let smoothed = (old_limit * (1.0 - self.smoothing) + new_limit * self.smoothing)
            .clamp(self.min_limit as f64, self.max_limit as f64);

        inner.limit = smoothed;
        let rounded_limit = smoothed as usize;
        self.limit.store(rounded_limit, Ordering::Release);

        rounded_limit
    }
}

impl std::fmt::Debug for Gradient2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gradient2")
            .field("limit", &self.limit)
            .field("min_limit", &self.min_limit)
            .field("max_limit", &self.max_limit)
            .field("tolerance", &self.tolerance)
            .field("smoothing", &self.smoothing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{DefaultLimiter, Limiter, Outcome};

    use super::*;

    #[tokio::test]
    async fn it_works() {
        static INIT_LIMIT: usize = 50;
        let gradient = Gradient2::new(INIT_LIMIT);

        let limiter = DefaultLimiter::new(gradient);

        /*
         * Concurrency = 40
         * Steady latency
         */
        let mut tokens = Vec::with_capacity(40);
        for _ in 0..40 {
            let token = limiter.try_acquire().await.unwrap();
            tokens.push(token);
        }
        for mut token in tokens {
            token.set_latency(Duration::from_millis(25));
            limiter.release(token, Some(Outcome::Success)).await;
        }
        let higher_limit = limiter.limit();
        assert!(
            higher_limit > INIT_LIMIT,
            "steady latency + high concurrency: increase limit, got {higher_limit}"
        );

        /*
         * Concurrency = 40
         * 10x previous latency
         */
        let mut tokens = Vec::with_capacity(40);
        for _ in 0..40 {
            let mut token = limiter.try_acquire().await.unwrap();
            token.set_latency(Duration::from_millis(250));
            tokens.push(token);
        }
        for token in tokens {
            limiter.release(token, Some(Outcome::Success)).await;
        }
        assert!(
            limiter.limit() < higher_limit,
            "increased latency: decrease limit"
        );
    }

    #[tokio::test]
    async fn app_limited_samples_do_not_change_the_limit() {
        let gradient = Gradient2::new(50);

        let limit = gradient
            .update(Sample {
                latency: Duration::from_millis(10),
                in_flight: 5,
                outcome: Outcome::Success,
            })
            .await;

        assert_eq!(limit, 50);
    }
}
