use std::time::Duration;

use async_trait::async_trait;

use super::{Limiter, Outcome, Token};

/// A wrapper which sleeps for a fixed delay before returning a rejection.
///
/// Useful in front of a caller that retries eagerly without its own backoff: stretching out the
/// time between a rejection and the next attempt reduces the retry rate without requiring the
/// caller to cooperate.
#[derive(Debug)]
pub struct RejectionDelay {
    delay: Duration,
    inner: Box<dyn Limiter>,
}

impl RejectionDelay {
    /// Wrap `limiter`, sleeping for `delay` before returning `None` on rejection.
    pub fn new(delay: Duration, limiter: impl Limiter + 'static) -> Self {
        Self {
            delay,
            inner: Box::new(limiter),
        }
    }

    async fn delay_if_rejected(&self, token: Option<Token>) -> Option<Token> {
        if token.is_none() {
            tracing::trace!(?self.delay, "delaying before returning a rejection");
            tokio::time::sleep(self.delay).await;
        }
        token
    }
}

#[async_trait]
impl Limiter for RejectionDelay {
    async fn try_acquire(&self) -> Option<Token> {
        let token = self.inner.try_acquire().await;
        self.delay_if_rejected(token).await
    }

    async fn acquire_timeout(&self, duration: Duration) -> Option<Token> {
        let token = self.inner.acquire_timeout(duration).await;
        self.delay_if_rejected(token).await
    }

    async fn release(&self, token: Token, outcome: Option<Outcome>) -> usize {
        self.inner.release(token, outcome).await
    }
}
