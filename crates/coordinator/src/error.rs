//! Error types for the coordinator

use crate::transaction::Stage;
use thiserror::Error;
use tmx_common::{ResourceId, Xid};

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Unknown resource key: {0}")]
    UnknownResourceKey(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(ResourceId),

    #[error("Unknown instance: {0}")]
    UnknownInstance(u64),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Xid),

    #[error("Resource {resource} is not part of transaction {xid}")]
    NotParticipant { xid: Xid, resource: ResourceId },

    #[error("Correlation already open for {0}")]
    DuplicateCorrelation(Xid),

    #[error("Invalid stage transition for {xid} at {resource}: {from:?} -> {to:?}")]
    InvalidTransition {
        xid: Xid,
        resource: ResourceId,
        from: Stage,
        to: Stage,
    },

    #[error("Transaction {0} still has resources in flight")]
    NotTerminal(Xid),

    #[error("Journal error: {0}")]
    Journal(#[from] tmx_journal::JournalError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] tmx_protocol::ProtocolError),
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
