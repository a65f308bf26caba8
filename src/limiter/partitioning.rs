use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{atomic, Arc},
    time::Duration,
};

use async_trait::async_trait;
use conv::{ConvAsUtil, ConvUtil};
use tokio::{
    sync::{oneshot, Mutex},
    time::timeout,
};

use crate::{
    error::PartitionConfigError,
    limiter::{DefaultLimiter, Limiter, Outcome, Token},
    limits::LimitAlgorithm,
};

use super::{
    token::{self, TokenInner},
    AtomicCapacityUnit, CapacityUnit,
};

type StateIndex = usize;

#[derive(Debug)]
pub(crate) struct Scheduler {
    partition_states: Vec<PartitionState>,
    waiters: Mutex<VecDeque<(StateIndex, oneshot::Sender<Token>)>>,
}

#[derive(Debug)]
struct PartitionState {
    fraction: f64,
    in_flight: Arc<AtomicCapacityUnit>,
}

/// A partition, reserving some fraction of a [DefaultLimiter]'s total limit.
#[derive(Debug)]
pub struct PartitionedLimiter<L> {
    index: StateIndex,
    scheduler: Arc<Scheduler>,
    limiter: Arc<DefaultLimiter<L>>,
    reject_delay: Option<Duration>,
}

impl<L: LimitAlgorithm + Sync> DefaultLimiter<L> {
    /// Divide up this limiter into a set of partitions with the given relative weights.
    ///
    /// The provided weights are normalised: weights of 2, 2 and 4 result in partitions of 25%,
    /// 25% and 50% of the total limit, respectively. `weights` must not be empty.
    pub fn create_static_partitions(
        self,
        weights: Vec<f64>,
    ) -> Result<Vec<PartitionedLimiter<L>>, PartitionConfigError> {
        if weights.is_empty() {
            return Err(PartitionConfigError::EmptyWeights);
        }

        let total: f64 = weights.iter().sum();

        let partition_states: Vec<PartitionState> = weights
            .into_iter()
            .map(|weight| PartitionState {
                fraction: weight / total,
                in_flight: Arc::new(AtomicCapacityUnit::new(0)),
            })
            .collect();

        let shared_limiter = Arc::new(self);
        let scheduler = Arc::new(Scheduler {
            partition_states,
            waiters: Mutex::new(VecDeque::new()),
        });

        let partitions = (0..scheduler.partition_states.len())
            .map(|index| PartitionedLimiter {
                index,
                scheduler: scheduler.clone(),
                limiter: shared_limiter.clone(),
                reject_delay: None,
            })
            .collect();

        Ok(partitions)
    }
}

impl<L> PartitionedLimiter<L> {
    /// Sleep for `delay` before returning `None` from this partition when neither it nor any
    /// sibling partition has spare capacity, instead of returning immediately.
    pub fn with_reject_delay(self, delay: Duration) -> Self {
        Self {
            reject_delay: Some(delay),
            ..self
        }
    }
}

impl Scheduler {
    pub(crate) fn reuse_permit(self: Arc<Scheduler>, token_inner: TokenInner) {
        tokio::spawn(async move {
            let waiter = self.waiters.lock().await.pop_front();
            match waiter {
                Some((index, waiter)) => {
                    let token = Token::new_from_inner(token_inner).for_partition(
                        token::Partition::new(
                            self.partition_states[index].in_flight.clone(),
                            self.clone(),
                        ),
                    );
                    let _ = waiter.send(token);
                }
                None => drop(token_inner),
            }
        });
    }

    /// Total spare capacity which can be used by any partition.
    fn spare(&self, total_limit: CapacityUnit) -> CapacityUnit {
        self.partition_states
            .iter()
            .fold(0, |total, partition| total + partition.spare(total_limit))
    }
}

impl PartitionState {
    const BUFFER_FRACTION: f64 = 0.1;

    fn limit(&self, total_limit: CapacityUnit) -> CapacityUnit {
        fractional_limit(total_limit, self.fraction)
    }

    fn in_flight(&self) -> CapacityUnit {
        self.in_flight.load(atomic::Ordering::SeqCst)
    }

    /// Spare capacity which can be used by other partitions.
    fn spare(&self, total_limit: CapacityUnit) -> CapacityUnit {
        let partition_limit = self.limit(total_limit);
        let buffer = (partition_limit as f64 * Self::BUFFER_FRACTION)
            .ceil()
            .approx_as::<CapacityUnit>()
            .expect("should be < usize::MAX");
        (partition_limit - self.in_flight()).saturating_sub(buffer)
    }
}

#[async_trait]
impl<L> Limiter for PartitionedLimiter<L>
where
    L: LimitAlgorithm + Sync + Send + Debug,
{
    async fn try_acquire(&self) -> Option<Token> {
        let state = &self.scheduler.partition_states[self.index];

        let total_limit = self.limiter.limit();
        if state.in_flight() < state.limit(total_limit) || self.scheduler.spare(total_limit) > 0 {
            self.limiter.try_acquire().await.map(|token| {
                token.for_partition(token::Partition::new(
                    state.in_flight.clone(),
                    self.scheduler.clone(),
                ))
            })
        } else {
            tracing::trace!(
                partition = self.index,
                in_flight = state.in_flight(),
                "partition overflow: no spare capacity in this partition or its siblings"
            );
            if let Some(delay) = self.reject_delay {
                tokio::time::sleep(delay).await;
            }
            None
        }
    }

    async fn acquire_timeout(&self, duration: Duration) -> Option<Token> {
        let state = &self.scheduler.partition_states[self.index];
        let result = timeout(duration, async {
            let total_limit = self.limiter.limit();
            if state.in_flight() < state.limit(total_limit) || self.scheduler.spare(total_limit) > 0
            {
                self.limiter.try_acquire().await
            } else {
                let (snd, rx) = oneshot::channel();
                self.scheduler
                    .waiters
                    .lock()
                    .await
                    .push_back((self.index, snd));
                rx.await.ok()
            }
        })
        .await;

        match result {
            Ok(Some(token)) => Some(token.for_partition(token::Partition::new(
                state.in_flight.clone(),
                self.scheduler.clone(),
            ))),
            _ => None,
        }
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        self.limiter.release(token, outcome).await
    }
}

/// A boxed resolver mapping a caller-supplied context to the name of the partition it belongs to.
///
/// Returning `None` means this resolver has no opinion; the next resolver in the chain is tried.
type Resolver<Context> = Box<dyn Fn(&Context) -> Option<String> + Send + Sync>;

/// Routes each `acquire` to one of a named set of partitions, by running an ordered chain of
/// resolvers over the caller-supplied `Context` until one names a partition.
///
/// An "unknown" partition, reserving none of the limit beyond the usual floor of 1, is always
/// present and is used whenever no resolver matches (including when the chain is empty).
pub struct PartitionRouter<Context, L> {
    names: Vec<String>,
    partitions: Vec<PartitionedLimiter<L>>,
    unknown: usize,
    resolvers: Vec<Resolver<Context>>,
}

/// One named partition in a [PartitionRouter], before its relative weight is normalised.
pub struct NamedPartition {
    /// The name resolvers map a context to.
    pub name: String,
    /// This partition's weight, relative to the others — see
    /// [`DefaultLimiter::create_static_partitions`].
    pub weight: f64,
}

impl<L> Clone for PartitionedLimiter<L> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            scheduler: self.scheduler.clone(),
            limiter: self.limiter.clone(),
            reject_delay: self.reject_delay,
        }
    }
}

impl<Context, L: LimitAlgorithm + Sync + Send + Debug> PartitionRouter<Context, L> {
    /// Build a router over `partitions`, plus an always-present "unknown" partition.
    ///
    /// `partitions` must not be empty.
    pub fn new(
        limiter: DefaultLimiter<L>,
        partitions: Vec<NamedPartition>,
    ) -> Result<Self, PartitionConfigError> {
        if partitions.is_empty() {
            return Err(PartitionConfigError::EmptyWeights);
        }

        let mut names: Vec<String> = partitions.iter().map(|p| p.name.clone()).collect();
        let mut weights: Vec<f64> = partitions.iter().map(|p| p.weight).collect();

        names.push("unknown".to_owned());
        weights.push(0.0);

        let partitions = limiter.create_static_partitions(weights)?;
        let unknown = partitions.len() - 1;

        Ok(Self {
            names,
            partitions,
            unknown,
            resolvers: Vec::new(),
        })
    }

    /// Append a resolver to the chain, tried after every resolver already added.
    pub fn with_resolver(
        mut self,
        resolver: impl Fn(&Context) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    fn resolve(&self, context: &Context) -> usize {
        for resolver in &self.resolvers {
            if let Some(name) = resolver(context) {
                if let Some(index) = self.names.iter().position(|n| *n == name) {
                    return index;
                }
            }
        }
        self.unknown
    }

    /// Report the resolved partition's current derived limit to the metrics sink.
    fn report_partition_limit(&self, index: usize) {
        let partition = &self.partitions[index];
        let total_limit = partition.limiter.limit();
        let limit = partition.scheduler.partition_states[index].limit(total_limit);
        partition
            .limiter
            .metrics()
            .record_partition_limit(&self.names[index], limit);
    }

    /// Try to acquire a token for the partition `context` resolves to, without waiting.
    pub async fn try_acquire(&self, context: &Context) -> Option<Token> {
        let index = self.resolve(context);
        tracing::trace!(partition = self.names[index].as_str(), "routed");
        self.report_partition_limit(index);
        self.partitions[index].try_acquire().await
    }

    /// Try to acquire a token for the partition `context` resolves to, waiting up to `duration`.
    pub async fn acquire_timeout(&self, context: &Context, duration: Duration) -> Option<Token> {
        let index = self.resolve(context);
        tracing::trace!(partition = self.names[index].as_str(), "routed");
        self.report_partition_limit(index);
        self.partitions[index].acquire_timeout(duration).await
    }

    /// Release a previously acquired token. Every partition shares the same underlying limiter,
    /// so which partition handles this is immaterial — the token already carries its own
    /// partition's bookkeeping.
    pub async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        self.partitions[self.unknown].release(token, outcome).await
    }
}

impl<Context, L> Debug for PartitionRouter<Context, L>
where
    L: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionRouter")
            .field("names", &self.names)
            .field("partitions", &self.partitions)
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

fn fractional_limit(limit: CapacityUnit, fraction: f64) -> CapacityUnit {
    let limit_f64 = limit as f64 * fraction;

    limit_f64
        .ceil()
        .approx()
        .unwrap_or(1)
        .max(1)
}
