use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Notify, Semaphore},
    time::timeout,
};

use crate::{
    limits::{LimitAlgorithm, Sample},
    metrics::{CallStatus, MetricsSink, NoopMetrics},
};

use super::token::Token;

/// The outcome of a piece of work, used to feed the configured [LimitAlgorithm].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The work completed successfully.
    Success,
    /// The work failed because the protected resource was overloaded.
    Overload,
}

impl Outcome {
    pub(crate) fn overloaded_or(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Overload, _) | (_, Outcome::Overload) => Outcome::Overload,
            _ => Outcome::Success,
        }
    }
}

/// A concurrency limiter.
///
/// Object-safe, so decorators can compose over `Box<dyn Limiter>`.
#[async_trait]
pub trait Limiter: Debug + Send + Sync {
    /// Try to acquire a [Token] without waiting.
    async fn try_acquire(&self) -> Option<Token>;

    /// Try to acquire a [Token], waiting up to `duration` if none is immediately available.
    async fn acquire_timeout(&self, duration: Duration) -> Option<Token>;

    /// Release a [Token] back to the limiter, with the job's [Outcome] (`None` to ignore it).
    ///
    /// Returns the limit in effect immediately after the release.
    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize;
}

/// A snapshot of a limiter's limit and in-flight count, for introspection and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    /// The current limit.
    pub limit: usize,
    /// The current number of in-flight jobs.
    pub in_flight: usize,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// The default [Limiter]: enforces a [LimitAlgorithm]-controlled limit using a semaphore.
pub struct DefaultLimiter<L> {
    id: u64,
    limit_algorithm: L,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    bypass: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    release_notifier: Option<Arc<Notify>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<L: LimitAlgorithm> DefaultLimiter<L> {
    /// Create a new limiter, using `limit_algorithm` to control the limit.
    pub fn new(limit_algorithm: L) -> Self {
        let limit = limit_algorithm.limit();
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            semaphore: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            limit_algorithm,
            bypass: None,
            release_notifier: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Notify `notifier` on every `release()`, so blocking decorators can wake waiters without
    /// polling. Typically shared with a [crate::limiter::BlockingLimiter] or similar wrapping this
    /// limiter.
    pub fn with_release_notifier(self, notifier: Arc<Notify>) -> Self {
        Self {
            release_notifier: Some(notifier),
            ..self
        }
    }

    /// Skip admission accounting entirely whenever `bypass` returns `true`.
    pub fn with_bypass(self, bypass: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            bypass: Some(Box::new(bypass)),
            ..self
        }
    }

    /// Record metrics to `metrics` instead of discarding them.
    pub fn with_metrics(self, metrics: impl MetricsSink + 'static) -> Self {
        Self {
            metrics: Arc::new(metrics),
            ..self
        }
    }

    /// The current limit.
    pub fn limit(&self) -> usize {
        self.limit_algorithm.limit()
    }

    /// The current number of in-flight jobs.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// A snapshot of the current limit and in-flight count.
    pub fn state(&self) -> LimiterState {
        LimiterState {
            limit: self.limit(),
            in_flight: self.in_flight(),
        }
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub(crate) fn in_flight_shared(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    async fn reconcile_permits(&self, old_limit: usize, new_limit: usize) {
        if new_limit > old_limit {
            self.semaphore.add_permits(new_limit - old_limit);
        } else if new_limit < old_limit {
            let semaphore = self.semaphore.clone();
            let to_remove = (old_limit - new_limit) as u32;
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many(to_remove).await {
                    permits.forget();
                }
            });
        }
    }
}

#[async_trait]
impl<L> Limiter for DefaultLimiter<L>
where
    L: LimitAlgorithm + Send + Sync,
{
    async fn try_acquire(&self) -> Option<Token> {
        if let Some(bypass) = &self.bypass {
            if bypass() {
                self.metrics.increment_call(CallStatus::Bypassed);
                return Some(Token::new_bypassed());
            }
        }

        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let token = Token::new(permit, self.in_flight.clone());
                self.metrics.record_in_flight(token.in_flight_at_start());
                Some(token)
            }
            Err(_) => {
                self.metrics.increment_call(CallStatus::Rejected);
                tracing::debug!(id = self.id, limit = self.limit(), "rejected: no permit available");
                None
            }
        }
    }

    async fn acquire_timeout(&self, duration: Duration) -> Option<Token> {
        if let Some(bypass) = &self.bypass {
            if bypass() {
                self.metrics.increment_call(CallStatus::Bypassed);
                return Some(Token::new_bypassed());
            }
        }

        match timeout(duration, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                let token = Token::new(permit, self.in_flight.clone());
                self.metrics.record_in_flight(token.in_flight_at_start());
                Some(token)
            }
            _ => {
                self.metrics.increment_call(CallStatus::Rejected);
                tracing::debug!(id = self.id, ?duration, "rejected: timed out waiting for a permit");
                None
            }
        }
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        if token.is_bypassed() {
            return self.limit();
        }

        let latency = token.latency();
        let in_flight = token.in_flight_at_start();
        drop(token);

        let limit = match outcome {
            Some(outcome) => {
                self.metrics.increment_call(match outcome {
                    Outcome::Success => CallStatus::Success,
                    Outcome::Overload => CallStatus::Overload,
                });
                self.metrics.record_min_latency(latency);

                let old_limit = self.limit();
                let new_limit = self
                    .limit_algorithm
                    .update(Sample {
                        latency,
                        in_flight,
                        outcome,
                    })
                    .await;
                self.metrics.record_limit(new_limit);
                if new_limit != old_limit {
                    tracing::debug!(id = self.id, old_limit, new_limit, ?outcome, "limit changed");
                }
                self.reconcile_permits(old_limit, new_limit).await;
                new_limit
            }
            None => {
                self.metrics.increment_call(CallStatus::Ignored);
                self.limit()
            }
        };

        if let Some(notifier) = &self.release_notifier {
            notifier.notify_waiters();
        }

        limit
    }
}

impl<L: Debug> Debug for DefaultLimiter<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultLimiter")
            .field("id", &self.id)
            .field("limit_algorithm", &self.limit_algorithm)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
