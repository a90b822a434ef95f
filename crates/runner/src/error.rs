//! Error types for the runner

use thiserror::Error;
use tmx_coordinator::CoordinatorError;

/// Result type for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runner errors
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Every sender of the inbound queue is gone without a shutdown message
    #[error("Inbound queue closed")]
    InboundClosed,
}
