//! Error types for the handful of genuinely fallible operations in this crate.
//!
//! Invalid *constructor* arguments (a zero limit, a percentile outside `(0, 1)`, ...) remain
//! programmer errors reported with `assert!`, matching the rest of this crate's builder style.
//! These two error types are for conditions that can legitimately arise from runtime
//! configuration or load, where a panic would be the wrong contract.

use thiserror::Error;

/// Errors from configuring a [`crate::PartitionedLimiter`] set.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PartitionConfigError {
    /// [`crate::DefaultLimiter::create_static_partitions`] was called with no weights.
    #[error("at least one partition weight is required")]
    EmptyWeights,
}

/// Errors surfaced through the future returned by a dispatcher bulkhead's `execute`.
#[derive(Debug, Error)]
pub enum BulkheadError {
    /// The bounded backlog was full when `execute` was called.
    #[error("bulkhead backlog is full")]
    BacklogFull,

    /// The dispatched task panicked.
    #[error("dispatched task panicked")]
    TaskPanicked,

    /// The dispatched task's future resolved to `Err(())`.
    #[error("dispatched task failed")]
    TaskFailed,
}
