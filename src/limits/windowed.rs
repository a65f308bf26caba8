use std::time::Duration;

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use crate::aggregation::Aggregator;

use super::{defaults::MIN_SAMPLE_LATENCY, LimitAlgorithm, Sample};

/// Wraps a [LimitAlgorithm], aggregating samples over a window before feeding it a single
/// combined sample.
///
/// Useful for stabilising algorithms like [`super::Vegas`] or [`super::Gradient`] against noisy,
/// per-request latency by aggregating over e.g. a time window or a fixed number of samples first.
pub struct Windowed<L, S> {
    min_window: Duration,
    max_window: Duration,
    min_samples: usize,
    min_latency: Duration,

    inner: L,

    window: Mutex<Window<S>>,
}

struct Window<S> {
    aggregator: S,
    start: Instant,
    duration: Duration,
}

impl<L: LimitAlgorithm, S: Aggregator> Windowed<L, S> {
    /// Wrap `inner`, aggregating samples with `aggregator` before each update.
    pub fn new(inner: L, aggregator: S) -> Self {
        let min_window = Duration::from_micros(1);
        Self {
            min_window,
            max_window: Duration::from_secs(1),
            min_samples: 10,
            min_latency: MIN_SAMPLE_LATENCY,

            inner,

            window: Mutex::new(Window {
                aggregator,
                duration: min_window,
                start: Instant::now(),
            }),
        }
    }

    /// The minimum number of samples required before a window can close.
    pub fn with_min_samples(mut self, samples: usize) -> Self {
        assert!(samples > 0, "at least one sample required per window");
        self.min_samples = samples;
        self
    }

    /// The minimum duration a window must span before it can close.
    pub fn with_min_window(mut self, min: Duration) -> Self {
        self.min_window = min;
        self
    }

    /// The maximum duration a window is allowed to span, regardless of observed latency.
    pub fn with_max_window(mut self, max: Duration) -> Self {
        self.max_window = max;
        self
    }
}

#[async_trait]
impl<L, S> LimitAlgorithm for Windowed<L, S>
where
    L: LimitAlgorithm + Send + Sync,
    S: Aggregator + Send + Sync,
{
    fn limit(&self) -> usize {
        self.inner.limit()
    }

    async fn update(&self, sample: Sample) -> usize {
        if sample.latency < self.min_latency {
            return self.inner.limit();
        }

        let mut window = self.window.lock().await;

        let agg_sample = window.aggregator.sample(sample);

        if window.aggregator.sample_size() >= self.min_samples
            && window.start.elapsed() >= window.duration
        {
            window.aggregator.reset();

            window.start = Instant::now();
            window.duration = agg_sample.latency.clamp(self.min_window, self.max_window);

            self.inner.update(agg_sample).await
        } else {
            self.inner.limit()
        }
    }
}

impl<L: std::fmt::Debug, S> std::fmt::Debug for Windowed<L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Windowed")
            .field("min_window", &self.min_window)
            .field("max_window", &self.max_window)
            .field("min_samples", &self.min_samples)
            .field("min_latency", &self.min_latency)
            .field("inner", &self.inner)
            .finish()
    }
}
