//! Error types for finalizer dispatch.
//!
//! Contract violations (non-monotonic epochs, scheduling on an unavailable
//! main-thread processor, double attach) are not represented here: they are
//! programmer errors and fail through `debug_assert!`. The only recoverable
//! failure is the inability to start the finalizer thread.

use thiserror::Error;

/// Errors reported by the finalizer processors.
#[derive(Debug, Error)]
pub enum FinalizerError {
    /// The OS refused to create the finalizer worker thread.
    #[error("failed to spawn finalizer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FinalizerError>;
