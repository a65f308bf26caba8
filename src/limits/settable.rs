use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{LimitAlgorithm, Sample};

/// A limit which can be set at runtime, ignoring observed samples.
///
/// Useful for manual overrides and for tests which want to pin a limit without wiring up a full
/// algorithm.
#[derive(Debug)]
pub struct Settable(AtomicUsize);

impl Settable {
    #[allow(missing_docs)]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0);

        Self(AtomicUsize::new(limit))
    }

    /// Set the limit to a new value, returning the previous one.
    pub fn set_limit(&self, limit: usize) -> usize {
        assert!(limit > 0);

        self.0.swap(limit, Ordering::AcqRel)
    }
}

#[async_trait]
impl LimitAlgorithm for Settable {
    fn limit(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    async fn update(&self, _sample: Sample) -> usize {
        self.limit()
    }
}
