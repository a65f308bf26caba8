use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::{error::BulkheadError, Limiter};

use super::{dispatch, BacklogEntry, BoxedTask, DefaultClassifier, ExceptionClassifier, Redrive};

struct Shared<T> {
    self_ref: Weak<Shared<T>>,
    limiter: Arc<dyn Limiter>,
    classifier: Arc<dyn ExceptionClassifier>,
    backlog: Mutex<VecDeque<BacklogEntry<T>>>,
    backlog_limit: usize,
    wip: AtomicUsize,
    max_dispatch_per_call: usize,
}

/// A dispatcher bulkhead which serves its backlog in FIFO order.
///
/// Tasks are *started* in the order they were enqueued; since each dispatched task runs
/// independently once it has a token, they may still *complete* out of order. A dispatched task's
/// completion re-triggers draining on its own, so a backlog entry queued behind a full limiter
/// runs as soon as any in-flight task releases its token, with no further `execute` call needed.
///
/// Cheaply cloneable: cloning shares the same backlog, limiter and work-in-progress counter.
pub struct FifoBulkhead<T>(Arc<Shared<T>>);

impl<T> Clone for FifoBulkhead<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + 'static> FifoBulkhead<T> {
    const DEFAULT_MAX_DISPATCH_PER_CALL: usize = 16;

    /// Create a bulkhead dispatching against `limiter`, with a bounded backlog of `backlog_limit`
    /// queued tasks.
    pub fn new(limiter: impl Limiter + 'static, backlog_limit: usize) -> Self {
        Self(Arc::new_cyclic(|self_ref| Shared {
            self_ref: self_ref.clone(),
            limiter: Arc::new(limiter),
            classifier: Arc::new(DefaultClassifier),
            backlog: Mutex::new(VecDeque::new()),
            backlog_limit,
            wip: AtomicUsize::new(0),
            max_dispatch_per_call: Self::DEFAULT_MAX_DISPATCH_PER_CALL,
        }))
    }

    /// Override the classifier used to translate dispatched-task failures into limiter outcomes.
    ///
    /// Must be called before the bulkhead is cloned or shared.
    pub fn with_classifier(mut self, classifier: impl ExceptionClassifier + 'static) -> Self {
        Arc::get_mut(&mut self.0)
            .expect("with_classifier must be called before the bulkhead is shared")
            .classifier = Arc::new(classifier);
        self
    }

    /// Override how many tasks a single drain pass is allowed to dispatch before yielding.
    ///
    /// Must be called before the bulkhead is cloned or shared.
    pub fn with_max_dispatch_per_call(mut self, max: usize) -> Self {
        assert!(max > 0);
        Arc::get_mut(&mut self.0)
            .expect("with_max_dispatch_per_call must be called before the bulkhead is shared")
            .max_dispatch_per_call = max;
        self
    }

    /// Enqueue `task`, to be run once a token is available.
    ///
    /// Resolves immediately with `Err(BulkheadError::BacklogFull)` if the backlog is already at
    /// capacity, without running `task` at all.
    pub async fn execute(
        &self,
        task: impl FnOnce() -> super::BoxedFuture<T> + Send + 'static,
    ) -> Result<T, BulkheadError> {
        let (snd, rx) = oneshot::channel();

        {
            let mut backlog = self.0.backlog.lock().await;
            if backlog.len() >= self.0.backlog_limit {
                tracing::debug!(
                    backlog_limit = self.0.backlog_limit,
                    "backlog full, rejecting task"
                );
                return Err(BulkheadError::BacklogFull);
            }
            backlog.push_back(BacklogEntry {
                task: Box::new(task) as BoxedTask<T>,
                result: snd,
            });
        }

        self.0.signal_drain().await;

        rx.await.unwrap_or(Err(BulkheadError::TaskPanicked))
    }
}

impl<T: Send + 'static> Shared<T> {
    /// An `Arc` handle to `self`, used to hand `dispatch` something it can redrive through once a
    /// dispatched task completes.
    fn handle(&self) -> Arc<dyn Redrive> {
        self.self_ref
            .upgrade()
            .expect("a Shared always has at least one outstanding Arc while running")
    }

    async fn signal_drain(&self) {
        if self.wip.fetch_add(1, Ordering::SeqCst) == 0 {
            self.drain_loop().await;
        }
    }

    async fn drain_loop(&self) {
        loop {
            let mut dispatched = 0;
            tracing::trace!("draining backlog");

            while dispatched < self.max_dispatch_per_call {
                let has_entry = {
                    let backlog = self.backlog.lock().await;
                    !backlog.is_empty()
                };
                if !has_entry {
                    break;
                }

                let Some(token) = self.limiter.try_acquire().await else {
                    break;
                };

                let entry = {
                    let mut backlog = self.backlog.lock().await;
                    backlog.pop_front()
                };

                let Some(entry) = entry else {
                    // Someone else drained it first; return the unused token's capacity.
                    self.limiter.release(token, None).await;
                    break;
                };

                dispatch(
                    self.limiter.clone(),
                    self.classifier.clone(),
                    self.handle(),
                    token,
                    entry,
                );
                dispatched += 1;
            }

            let missed = self.wip.fetch_sub(dispatched, Ordering::SeqCst) - dispatched;
            if missed == 0 {
                break;
            }
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Redrive for Shared<T> {
    async fn redrive(&self) {
        self.signal_drain().await;
    }
}

impl<T> std::fmt::Debug for FifoBulkhead<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoBulkhead")
            .field("backlog_limit", &self.0.backlog_limit)
            .field("max_dispatch_per_call", &self.0.max_dispatch_per_call)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{limits::Fixed, DefaultLimiter};

    use super::*;

    #[tokio::test]
    async fn runs_a_task_immediately_when_capacity_is_free() {
        let bulkhead = FifoBulkhead::new(DefaultLimiter::new(Fixed::new(1)), 10);

        let result = bulkhead
            .execute(|| Box::pin(async { Ok(42) }))
            .await
            .unwrap();

        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn queues_when_no_capacity_and_dispatches_on_release() {
        let bulkhead = FifoBulkhead::new(DefaultLimiter::new(Fixed::new(1)), 10);

        // Hold the only permit with a task that waits to be told to finish.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let holder = {
            let bulkhead = bulkhead.clone();
            let release_rx = release_rx.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(move || {
                        let release_rx = release_rx.clone();
                        Box::pin(async move {
                            let rx = release_rx.lock().await.take().unwrap();
                            let _ = rx.await;
                            Ok(1)
                        })
                    })
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let queued = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.execute(|| Box::pin(async { Ok(2) })).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        release_tx.send(()).unwrap();

        assert_eq!(holder.await.unwrap().unwrap(), 1);
        assert_eq!(queued.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn a_second_backlog_entry_drains_when_the_first_releases_with_no_further_enqueue() {
        // Regression test: both entries are queued up front, behind a single permit, so the
        // second one can only drain because the first dispatched task's completion re-signals
        // draining on its own, not because of some later `execute` call noticing it.
        let bulkhead = FifoBulkhead::new(DefaultLimiter::new(Fixed::new(1)), 10);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let first = {
            let bulkhead = bulkhead.clone();
            let release_rx = release_rx.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(move || {
                        let release_rx = release_rx.clone();
                        Box::pin(async move {
                            let rx = release_rx.lock().await.take().unwrap();
                            let _ = rx.await;
                            Ok(10)
                        })
                    })
                    .await
            })
        };

        // Give the first call time to claim the only permit and exit the drain loop with the
        // second entry still queued behind it.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.execute(|| Box::pin(async { Ok(20) })).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        release_tx.send(()).unwrap();

        assert_eq!(first.await.unwrap().unwrap(), 10);
        assert_eq!(second.await.unwrap().unwrap(), 20);
    }

    #[tokio::test]
    async fn backlog_full_rejects_without_running_the_task() {
        let bulkhead = FifoBulkhead::new(DefaultLimiter::new(Fixed::new(1)), 0);

        let result = bulkhead.execute(|| Box::pin(async { Ok(1) })).await;
        assert!(matches!(result, Err(BulkheadError::BacklogFull)));
    }
}
