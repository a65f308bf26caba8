use std::{
    sync::{
        atomic::{self, AtomicUsize},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::OwnedSemaphorePermit, time::Instant};

use super::partitioning::Scheduler;

/// A concurrency token, required to run a job.
///
/// Release the token back to the [crate::Limiter] after the job is complete, passing the job's
/// [crate::Outcome] (or `None` to ignore it entirely). A token dropped without being released
/// falls back to ignore semantics, still freeing its slot.
#[derive(Debug)]
pub struct Token {
    inner: Option<TokenInner>,
    partition: Option<Partition>,
    bypassed: bool,

    in_flight_at_start: usize,
    start: Instant,
    #[cfg(test)]
    latency: Duration,
}

#[derive(Debug)]
pub(crate) struct TokenInner {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub(crate) struct Partition {
    in_flight: Arc<AtomicUsize>,
    scheduler: Arc<Scheduler>,
}

impl Token {
    pub(crate) fn new(permit: OwnedSemaphorePermit, in_flight: Arc<AtomicUsize>) -> Self {
        let in_flight_at_start = in_flight.fetch_add(1, atomic::Ordering::SeqCst) + 1;
        Self {
            inner: Some(TokenInner {
                _permit: permit,
                in_flight,
            }),
            partition: None,
            bypassed: false,
            in_flight_at_start,
            start: Instant::now(),
            #[cfg(test)]
            latency: Duration::ZERO,
        }
    }

    pub(crate) fn new_from_inner(inner: TokenInner) -> Self {
        Self {
            inner: Some(inner),
            partition: None,
            bypassed: false,
            in_flight_at_start: 0,
            start: Instant::now(),
            #[cfg(test)]
            latency: Duration::ZERO,
        }
    }

    /// A token which doesn't account for any capacity, used when a bypass predicate matches.
    pub(crate) fn new_bypassed() -> Self {
        Self {
            inner: None,
            partition: None,
            bypassed: true,
            in_flight_at_start: 0,
            start: Instant::now(),
            #[cfg(test)]
            latency: Duration::ZERO,
        }
    }

    pub(crate) fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    pub(crate) fn in_flight_at_start(&self) -> usize {
        self.in_flight_at_start
    }

    pub(crate) fn for_partition(mut self, partition: Partition) -> Self {
        partition.in_flight.fetch_add(1, atomic::Ordering::SeqCst);
        self.partition = Some(partition);
        self
    }

    #[cfg(test)]
    pub(crate) fn set_latency(&mut self, latency: Duration) {
        use std::ops::Sub;

        self.start = Instant::now().sub(latency);
        self.latency = latency;
    }

    #[cfg(test)]
    pub(crate) fn latency(&self) -> Duration {
        self.latency
    }

    #[cfg(not(test))]
    pub(crate) fn latency(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Token {
    /// Reduces the number of jobs in flight and, for a partitioned token, hands the permit to the
    /// next partition waiter.
    fn drop(&mut self) {
        if let Some(partition) = self.partition.take() {
            partition.in_flight.fetch_sub(1, atomic::Ordering::SeqCst);
            if let Some(inner) = self.inner.take() {
                partition.scheduler.reuse_permit(inner);
            }
        }
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, atomic::Ordering::SeqCst);
    }
}

impl Partition {
    pub(crate) fn new(in_flight: Arc<AtomicUsize>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            in_flight,
            scheduler,
        }
    }
}
