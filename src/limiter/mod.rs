mod blocking;
mod lifo;
mod limiter;
mod partitioning;
mod rejection_delay;
mod token;

pub(crate) type CapacityUnit = usize;
pub(crate) type AtomicCapacityUnit = std::sync::atomic::AtomicUsize;

pub use blocking::{BlockingLimiter, DeadlineLimiter};
pub use lifo::LifoBlockingLimiter;
pub use limiter::{DefaultLimiter, Limiter, LimiterState, Outcome};
pub use partitioning::{NamedPartition, PartitionRouter, PartitionedLimiter};
pub use rejection_delay::RejectionDelay;
pub use token::Token;
