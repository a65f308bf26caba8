use async_trait::async_trait;

use super::{LimitAlgorithm, Sample};

/// A constant concurrency limit, never adjusted in response to samples.
///
/// Useful as a baseline for comparison against an adaptive algorithm, or in tests where a
/// deterministic limit is more useful than a self-tuning one.
#[derive(Debug, Clone, Copy)]
pub struct Fixed {
    limit: usize,
}

impl Fixed {
    /// Create a new fixed limit. `limit` must be greater than zero.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "a fixed limit of zero would admit nothing");

        Self { limit }
    }
}

#[async_trait]
impl LimitAlgorithm for Fixed {
    fn limit(&self) -> usize {
        self.limit
    }

    async fn update(&self, _sample: Sample) -> usize {
        self.limit
    }
}
