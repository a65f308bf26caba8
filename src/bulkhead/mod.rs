//! Dispatcher bulkheads: a bounded backlog in front of a [`crate::Limiter`], which asynchronously
//! dispatches queued tasks as tokens become available instead of rejecting callers outright.

mod fifo;
mod round_robin;

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::{error::BulkheadError, Limiter, Outcome, Token};

pub use fifo::FifoBulkhead;
pub use round_robin::RoundRobinBulkhead;

/// A handle back to a bulkhead's own backlog, used by [`dispatch`] to re-trigger draining once a
/// dispatched task frees up capacity.
///
/// Without this, a backlog entry that arrives while every permit is taken would depend on some
/// future `execute` call to notice it; under sustained load with no new enqueues, it would never
/// run.
#[async_trait]
pub(crate) trait Redrive: Send + Sync {
    async fn redrive(&self);
}

/// A boxed, type-erased future returned by a dispatched task.
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = Result<T, ()>> + Send>>;

/// A boxed, type-erased task supplier handed to a bulkhead's `execute`.
pub type BoxedTask<T> = Box<dyn FnOnce() -> BoxedFuture<T> + Send>;

pub(crate) struct BacklogEntry<T> {
    task: BoxedTask<T>,
    result: oneshot::Sender<Result<T, BulkheadError>>,
}

/// The cause of a dispatched task's failure, passed to an [ExceptionClassifier].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadTaskError {
    /// The task's future panicked while running.
    Panicked,
    /// The task's future resolved to `Err(())`.
    Failed,
}

/// Decides which [Outcome] a failed dispatched task should feed back to the limiter.
///
/// Returning `None` causes the token to be released with `release(token, None)`, meaning the
/// failure is ignored entirely for the purposes of limit adjustment.
pub trait ExceptionClassifier: std::fmt::Debug + Send + Sync {
    /// Classify `error` into an [Outcome], or `None` to ignore it.
    fn classify(&self, error: &BulkheadTaskError) -> Option<Outcome>;
}

/// The default [ExceptionClassifier]: every failure, panic or otherwise, counts as overload.
#[derive(Debug, Default)]
pub struct DefaultClassifier;

impl ExceptionClassifier for DefaultClassifier {
    fn classify(&self, _error: &BulkheadTaskError) -> Option<Outcome> {
        Some(Outcome::Overload)
    }
}

/// Runs `entry`'s task with `token`, releasing it with a classified outcome and forwarding the
/// result through the entry's oneshot sender once the task completes.
///
/// Spawned so the dispatching task (typically a drain loop) never blocks on arbitrary caller code.
pub(crate) fn dispatch<T: Send + 'static>(
    limiter: Arc<dyn Limiter>,
    classifier: Arc<dyn ExceptionClassifier>,
    redrive: Arc<dyn Redrive>,
    token: Token,
    entry: BacklogEntry<T>,
) {
    tokio::spawn(async move {
        let BacklogEntry { task, result } = entry;

        let join = tokio::spawn(task()).await;

        let (outcome, sent) = match join {
            Ok(Ok(value)) => (Some(Outcome::Success), Ok(value)),
            Ok(Err(())) => {
                let outcome = classifier.classify(&BulkheadTaskError::Failed);
                (outcome, Err(BulkheadError::TaskFailed))
            }
            Err(_join_error) => {
                let outcome = classifier.classify(&BulkheadTaskError::Panicked);
                (outcome, Err(BulkheadError::TaskPanicked))
            }
        };

        limiter.release(token, outcome).await;
        redrive.redrive().await;
        let _ = result.send(sent);
    });
}
