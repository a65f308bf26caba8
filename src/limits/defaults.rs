use std::time::Duration;

/// Samples faster than this are treated as noise (timer resolution, cache hits) and dropped
/// before they reach an algorithm or window aggregator.
pub(crate) const MIN_SAMPLE_LATENCY: Duration = Duration::from_micros(1);
