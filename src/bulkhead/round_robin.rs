use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
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
    max_dispatch_per_call: usize,
}

/// A dispatcher bulkhead which serves its backlog without strict ordering guarantees.
///
/// Unlike [`super::FifoBulkhead`], there's no work-in-progress gate: any number of callers may
/// drain concurrently. An entry that can't immediately get a token is pushed back onto the tail of
/// the backlog rather than blocking the drain, so one stalled partition doesn't starve the rest.
/// A dispatched task's completion re-triggers a drain pass on its own, so requeued entries are
/// retried as soon as any in-flight task frees a token.
///
/// Cheaply cloneable: cloning shares the same backlog and limiter.
pub struct RoundRobinBulkhead<T>(Arc<Shared<T>>);

impl<T> Clone for RoundRobinBulkhead<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + 'static> RoundRobinBulkhead<T> {
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

    /// Override how many entries a single drain pass is allowed to examine before returning.
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

        self.0.drain().await;

        rx.await.unwrap_or(Err(BulkheadError::TaskPanicked))
    }
}

impl<T: Send + 'static> Shared<T> {
    fn handle(&self) -> Arc<dyn Redrive> {
        self.self_ref
            .upgrade()
            .expect("a Shared always has at least one outstanding Arc while running")
    }

    async fn drain(&self) {
        for _ in 0..self.max_dispatch_per_call {
            let entry = {
                let mut backlog = self.backlog.lock().await;
                backlog.pop_front()
            };

            let Some(entry) = entry else { return };

            match self.limiter.try_acquire().await {
                Some(token) => {
                    dispatch(
                        self.limiter.clone(),
                        self.classifier.clone(),
                        self.handle(),
                        token,
                        entry,
                    );
                }
                None => {
                    tracing::trace!("no token available, requeuing entry to the tail");
                    let mut backlog = self.backlog.lock().await;
                    backlog.push_back(entry);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Redrive for Shared<T> {
    async fn redrive(&self) {
        self.drain().await;
    }
}

impl<T> std::fmt::Debug for RoundRobinBulkhead<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRobinBulkhead")
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
        let bulkhead = RoundRobinBulkhead::new(DefaultLimiter::new(Fixed::new(1)), 10);

        let result = bulkhead
            .execute(|| Box::pin(async { Ok(7) }))
            .await
            .unwrap();

        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn requeued_entry_drains_when_the_holder_releases_with_no_further_enqueue() {
        // Regression test: the holder's completion (via `dispatch`) must re-signal draining on
        // its own so the requeued entry runs, with no caller ever calling `drain` again.
        let bulkhead = RoundRobinBulkhead::new(DefaultLimiter::new(Fixed::new(1)), 10);

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
            tokio::spawn(async move { bulkhead.execute(|| Box::pin(async { Ok(9) })).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        release_tx.send(()).unwrap();

        assert_eq!(holder.await.unwrap().unwrap(), 1);
        assert_eq!(queued.await.unwrap().unwrap(), 9);
    }
}
