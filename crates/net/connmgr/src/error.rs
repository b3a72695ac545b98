//! Error types for the connection manager and decay registry.

use std::time::Duration;

/// Errors from [`ConnManager`](crate::ConnManager) construction.
#[derive(Debug, thiserror::Error)]
pub enum ConnMgrError {
    #[error("invalid watermarks: low water {low} is greater than high water {high}")]
    InvalidWatermarks { low: usize, high: usize },
}

/// Errors from the decaying tag registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("decaying tag already registered: {0}")]
    DuplicateTag(String),
    #[error("tag interval {interval:?} is finer than the decayer resolution {resolution:?}")]
    IntervalTooFine {
        interval: Duration,
        resolution: Duration,
    },
    #[error("decaying tag is closed: {0}")]
    TagClosed(String),
    #[error("decay registry has shut down")]
    RegistryShutDown,
}

/// Transport-level failure while closing a connection during a trim pass.
///
/// Close failures never abort the trim; they are collected in the
/// [`TrimReport`](crate::TrimReport).
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection close failed: {reason}")]
pub struct CloseError {
    pub reason: String,
}

impl CloseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
