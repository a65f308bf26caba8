use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::Notify,
    time::{timeout, Instant},
};

use super::{Limiter, Outcome, Token};

/// A safety bound on how long [BlockingLimiter] and [DeadlineLimiter] will wait for a permit,
/// regardless of the configured timeout.
const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// A wrapper which waits for capacity instead of returning `None` immediately.
///
/// Wraps a limiter which doesn't block (e.g. [crate::DefaultLimiter] used directly), retrying on
/// every release until a permit is available or `timeout` elapses. The wrapped limiter must be
/// constructed with [crate::DefaultLimiter::with_release_notifier] sharing the same [Notify] given
/// here, or this will only find out about new capacity once `timeout` elapses.
#[derive(Debug)]
pub struct BlockingLimiter {
    inner: Box<dyn Limiter>,
    release_notifier: Arc<Notify>,
    timeout: Duration,
}

impl BlockingLimiter {
    /// Wrap `limiter`, waiting up to `timeout` for a permit on each acquisition attempt.
    pub fn new(limiter: impl Limiter + 'static, release_notifier: Arc<Notify>, timeout: Duration) -> Self {
        assert!(timeout <= MAX_TIMEOUT, "timeout is implausibly long");
        Self {
            inner: Box::new(limiter),
            release_notifier,
            timeout,
        }
    }
}

#[async_trait]
impl Limiter for BlockingLimiter {
    async fn try_acquire(&self) -> Option<Token> {
        wait_for_token(self.inner.as_ref(), &self.release_notifier, self.timeout).await
    }

    async fn acquire_timeout(&self, duration: Duration) -> Option<Token> {
        wait_for_token(
            self.inner.as_ref(),
            &self.release_notifier,
            self.timeout.min(duration),
        )
        .await
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        self.inner.release(token, outcome).await
    }
}

/// A wrapper which waits for capacity until a fixed deadline, rather than a duration counted from
/// the start of each attempt.
///
/// Useful when a caller already has a deadline in mind (e.g. a request's own timeout) and wants
/// every limiter in a chain to respect the same clock.
#[derive(Debug)]
pub struct DeadlineLimiter {
    inner: Box<dyn Limiter>,
    release_notifier: Arc<Notify>,
    deadline: Instant,
}

impl DeadlineLimiter {
    /// Wrap `limiter`, waiting for a permit until `deadline`.
    pub fn new(limiter: impl Limiter + 'static, release_notifier: Arc<Notify>, deadline: Instant) -> Self {
        Self {
            inner: Box::new(limiter),
            release_notifier,
            deadline,
        }
    }
}

#[async_trait]
impl Limiter for DeadlineLimiter {
    async fn try_acquire(&self) -> Option<Token> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        wait_for_token(self.inner.as_ref(), &self.release_notifier, remaining).await
    }

    async fn acquire_timeout(&self, duration: Duration) -> Option<Token> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        wait_for_token(
            self.inner.as_ref(),
            &self.release_notifier,
            remaining.min(duration),
        )
        .await
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        self.inner.release(token, outcome).await
    }
}

async fn wait_for_token(
    inner: &(dyn Limiter),
    release_notifier: &Notify,
    deadline: Duration,
) -> Option<Token> {
    let attempt = async {
        loop {
            if let Some(token) = inner.try_acquire().await {
                return token;
            }
            release_notifier.notified().await;
        }
    };

    timeout(deadline, attempt).await.ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Duration;

    use crate::{limits::Fixed, DefaultLimiter};

    use super::*;

    #[tokio::test]
    async fn blocking_waits_for_a_released_permit() {
        let release_notifier = Arc::new(Notify::new());
        let inner = DefaultLimiter::new(Fixed::new(1)).with_release_notifier(release_notifier.clone());

        let held = inner.try_acquire().await.unwrap();
        let limiter = Arc::new(BlockingLimiter::new(
            inner,
            release_notifier,
            Duration::from_millis(500),
        ));

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.try_acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.release(held, Some(Outcome::Success)).await;

        assert!(waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blocking_gives_up_after_timeout() {
        let release_notifier = Arc::new(Notify::new());
        let inner = DefaultLimiter::new(Fixed::new(1)).with_release_notifier(release_notifier.clone());
        let _held = inner.try_acquire().await.unwrap();

        let limiter = BlockingLimiter::new(inner, release_notifier, Duration::from_millis(20));
        assert!(limiter.try_acquire().await.is_none());
    }

    #[tokio::test]
    async fn deadline_returns_none_once_passed() {
        let release_notifier = Arc::new(Notify::new());
        let inner = DefaultLimiter::new(Fixed::new(1)).with_release_notifier(release_notifier.clone());
        let _held = inner.try_acquire().await.unwrap();

        let deadline = Instant::now() - Duration::from_millis(1);
        let limiter = DeadlineLimiter::new(inner, release_notifier, deadline);

        assert!(limiter.try_acquire().await.is_none());
    }
}
