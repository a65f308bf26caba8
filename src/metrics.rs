//! A minimal, swappable metrics facade.
//!
//! The core never depends on a concrete metrics backend. Callers bridge [`MetricsSink`] to
//! whatever registry (Prometheus, StatsD, ...) they already use; this crate ships only
//! [`NoopMetrics`] (the default) and [`RecordingMetrics`], an in-memory sink used by its own
//! tests.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// The canonical `call` counter tag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    /// The call completed successfully.
    Success,
    /// The call failed due to overload.
    Overload,
    /// The call's outcome was ignored for limiting purposes.
    Ignored,
    /// The call was rejected before it started.
    Rejected,
    /// The call bypassed the limiter entirely.
    Bypassed,
}

/// A minimal counter/gauge/distribution facade, kept intentionally thin.
pub trait MetricsSink: Debug + Send + Sync {
    /// Increment the `call` counter for the given status.
    fn increment_call(&self, status: CallStatus);

    /// Record a reading of the `inflight` distribution.
    fn record_in_flight(&self, in_flight: usize);

    /// Record the current value of the `limit` gauge.
    fn record_limit(&self, limit: usize);

    /// Record a reading of the `min_rtt` distribution.
    fn record_min_latency(&self, latency: Duration);

    /// Record the current value of a named partition's `partition_limit` gauge.
    fn record_partition_limit(&self, partition: &str, limit: usize);
}

impl<T: MetricsSink + ?Sized> MetricsSink for Arc<T> {
    fn increment_call(&self, status: CallStatus) {
        (**self).increment_call(status);
    }

    fn record_in_flight(&self, in_flight: usize) {
        (**self).record_in_flight(in_flight);
    }

    fn record_limit(&self, limit: usize) {
        (**self).record_limit(limit);
    }

    fn record_min_latency(&self, latency: Duration) {
        (**self).record_min_latency(latency);
    }

    fn record_partition_limit(&self, partition: &str, limit: usize) {
        (**self).record_partition_limit(partition, limit);
    }
}

/// A [`MetricsSink`] that discards everything. The default for limiters that don't configure one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_call(&self, _status: CallStatus) {}
    fn record_in_flight(&self, _in_flight: usize) {}
    fn record_limit(&self, _limit: usize) {}
    fn record_min_latency(&self, _latency: Duration) {}
    fn record_partition_limit(&self, _partition: &str, _limit: usize) {}
}

/// An in-memory [`MetricsSink`] which records counts, for use in tests.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    success: AtomicU64,
    overload: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
    bypassed: AtomicU64,
    last_limit: AtomicUsize,
    last_min_latency: Mutex<Option<Duration>>,
    last_partition_limit: Mutex<Option<(String, usize)>>,
}

impl RecordingMetrics {
    /// Creates a new, empty `RecordingMetrics`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of calls recorded with the given status.
    pub fn calls(&self, status: CallStatus) -> u64 {
        self.counter(status).load(Ordering::Acquire)
    }

    /// Returns the last recorded limit value.
    pub fn last_limit(&self) -> usize {
        self.last_limit.load(Ordering::Acquire)
    }

    /// Returns the last recorded minimum latency, if any.
    pub fn last_min_latency(&self) -> Option<Duration> {
        *self.last_min_latency.lock().expect("not poisoned")
    }

    /// Returns the last recorded partition limit, if any.
    pub fn last_partition_limit(&self) -> Option<(String, usize)> {
        self.last_partition_limit.lock().expect("not poisoned").clone()
    }

    fn counter(&self, status: CallStatus) -> &AtomicU64 {
        match status {
            CallStatus::Success => &self.success,
            CallStatus::Overload => &self.overload,
            CallStatus::Ignored => &self.ignored,
            CallStatus::Rejected => &self.rejected,
            CallStatus::Bypassed => &self.bypassed,
        }
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment_call(&self, status: CallStatus) {
        self.counter(status).fetch_add(1, Ordering::AcqRel);
    }

    fn record_in_flight(&self, _in_flight: usize) {}

    fn record_limit(&self, limit: usize) {
        self.last_limit.store(limit, Ordering::Release);
    }

    fn record_min_latency(&self, latency: Duration) {
        *self.last_min_latency.lock().expect("not poisoned") = Some(latency);
    }

    fn record_partition_limit(&self, partition: &str, limit: usize) {
        *self.last_partition_limit.lock().expect("not poisoned") = Some((partition.to_owned(), limit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_metrics_counts_calls_by_status() {
        let metrics = RecordingMetrics::new();
        metrics.increment_call(CallStatus::Success);
        metrics.increment_call(CallStatus::Success);
        metrics.increment_call(CallStatus::Rejected);

        assert_eq!(metrics.calls(CallStatus::Success), 2);
        assert_eq!(metrics.calls(CallStatus::Rejected), 1);
        assert_eq!(metrics.calls(CallStatus::Overload), 0);
    }

    #[test]
    fn recording_metrics_tracks_min_latency_and_partition_limit() {
        let metrics = RecordingMetrics::new();
        assert_eq!(metrics.last_min_latency(), None);
        assert_eq!(metrics.last_partition_limit(), None);

        metrics.record_min_latency(Duration::from_millis(5));
        metrics.record_partition_limit("checkout", 7);

        assert_eq!(metrics.last_min_latency(), Some(Duration::from_millis(5)));
        assert_eq!(
            metrics.last_partition_limit(),
            Some(("checkout".to_owned(), 7))
        );
    }

    #[test]
    fn noop_metrics_does_nothing_observable() {
        let metrics = NoopMetrics;
        metrics.increment_call(CallStatus::Success);
        metrics.record_limit(10);
    }
}
