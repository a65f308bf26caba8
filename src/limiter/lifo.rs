use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{oneshot, Mutex, Notify},
    time::timeout,
};

use super::{Limiter, Outcome, Token};

type EntryId = u64;

/// A wrapper which queues waiters when no capacity is available, serving the most recently queued
/// waiter first.
///
/// LIFO ordering favours recent requests over older ones, so a caller which has already started
/// retrying or has given up (its `acquire_timeout` future was dropped) doesn't hold a place at the
/// front of the line. Combined with a short `backlog_limit` this approximates "shed the oldest
/// work first", which suits systems under sustained overload better than a plain FIFO queue.
pub struct LifoBlockingLimiter {
    inner: Box<dyn Limiter>,
    release_notifier: Arc<Notify>,
    backlog: Arc<Mutex<VecDeque<(EntryId, oneshot::Sender<Token>)>>>,
    backlog_limit: usize,
    next_id: AtomicU64,
}

impl LifoBlockingLimiter {
    /// Wrap `limiter`, queueing up to `backlog_limit` waiters when it has no spare capacity.
    pub fn new(limiter: impl Limiter + 'static, release_notifier: Arc<Notify>, backlog_limit: usize) -> Self {
        Self {
            inner: Box::new(limiter),
            release_notifier,
            backlog: Arc::new(Mutex::new(VecDeque::new())),
            backlog_limit,
            next_id: AtomicU64::new(0),
        }
    }

    async fn drain_one(&self) {
        loop {
            let next = {
                let mut backlog = self.backlog.lock().await;
                backlog.pop_back()
            };
            let Some((_, waiter)) = next else { return };

            match self.inner.try_acquire().await {
                Some(token) => {
                    if waiter.send(token).is_ok() {
                        return;
                    }
                    // Waiter already gave up; keep draining in case another is still waiting.
                }
                None => return,
            }
        }
    }

    async fn enqueue(&self) -> Option<(EntryId, oneshot::Receiver<Token>)> {
        let mut backlog = self.backlog.lock().await;
        if backlog.len() >= self.backlog_limit {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (snd, rx) = oneshot::channel();
        backlog.push_back((id, snd));
        Some((id, rx))
    }

    async fn remove(&self, id: EntryId) {
        let mut backlog = self.backlog.lock().await;
        if let Some(pos) = backlog.iter().position(|(entry, _)| *entry == id) {
            backlog.remove(pos);
        }
    }
}

#[async_trait]
impl Limiter for LifoBlockingLimiter {
    async fn try_acquire(&self) -> Option<Token> {
        self.inner.try_acquire().await
    }

    async fn acquire_timeout(&self, duration: Duration) -> Option<Token> {
        if let Some(token) = self.inner.try_acquire().await {
            return Some(token);
        }

        let Some((id, rx)) = self.enqueue().await else {
            return None;
        };

        let mut guard = CancelGuard {
            backlog: self.backlog.clone(),
            id: Some(id),
        };

        let result = timeout(duration, rx).await;
        guard.id = None;

        match result {
            Ok(Ok(token)) => Some(token),
            _ => {
                self.remove(id).await;
                None
            }
        }
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        let limit = self.inner.release(token, outcome).await;
        self.release_notifier.notify_waiters();
        self.drain_one().await;
        limit
    }
}

/// Removes a queued entry from the backlog if the holding future is dropped before resolving
/// (e.g. the caller cancelled the acquisition).
struct CancelGuard {
    backlog: Arc<Mutex<VecDeque<(EntryId, oneshot::Sender<Token>)>>>,
    id: Option<EntryId>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let backlog = self.backlog.clone();
            tokio::spawn(async move {
                let mut backlog = backlog.lock().await;
                if let Some(pos) = backlog.iter().position(|(entry, _)| *entry == id) {
                    backlog.remove(pos);
                }
            });
        }
    }
}

impl std::fmt::Debug for LifoBlockingLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifoBlockingLimiter")
            .field("backlog_limit", &self.backlog_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{limits::Fixed, DefaultLimiter};

    use super::*;

    #[tokio::test]
    async fn serves_most_recent_waiter_first() {
        let release_notifier = Arc::new(Notify::new());
        let inner = DefaultLimiter::new(Fixed::new(1)).with_release_notifier(release_notifier.clone());
        let held = inner.try_acquire().await.unwrap();

        let limiter = Arc::new(LifoBlockingLimiter::new(inner, release_notifier, 10));

        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for i in 0..3 {
            let limiter = limiter.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                if limiter
                    .acquire_timeout(Duration::from_millis(100))
                    .await
                    .is_some()
                {
                    order.lock().await.push(i);
                }
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        limiter.release(held, Some(Outcome::Success)).await;
        waiters.remove(0).await.unwrap();

        let seen = order.lock().await.clone();
        assert_eq!(seen, vec![2], "the most recently queued waiter is served first");
    }

    #[tokio::test]
    async fn backlog_full_rejects_immediately() {
        let release_notifier = Arc::new(Notify::new());
        let inner = DefaultLimiter::new(Fixed::new(1)).with_release_notifier(release_notifier.clone());
        let _held = inner.try_acquire().await.unwrap();

        let limiter = LifoBlockingLimiter::new(inner, release_notifier, 0);
        assert!(limiter
            .acquire_timeout(Duration::from_millis(10))
            .await
            .is_none());
    }
}
