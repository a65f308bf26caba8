//! Dynamic congestion-based concurrency limits for controlling backpressure.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod aggregation;
pub mod bulkhead;
pub mod error;
mod limiter;
pub mod limits;
pub mod metrics;
mod moving_avg;

pub use limiter::{
    BlockingLimiter, DeadlineLimiter, DefaultLimiter, LifoBlockingLimiter, Limiter, LimiterState,
    NamedPartition, Outcome, PartitionRouter, PartitionedLimiter, RejectionDelay, Token,
};
