//! Message transport between processes
//!
//! The transaction manager never blocks on delivery. A [`Transport`] either
//! accepts a message right away or hands it back, so the caller can keep it
//! and try again later.

use thiserror::Error;
use tmx_common::QueueId;

pub mod memory;
pub mod message;

pub use memory::MemoryTransport;
pub use message::Message;

/// Reasons a non-blocking send was refused. The message is returned to the
/// caller in both cases.
#[derive(Debug, Error)]
pub enum SendError {
    /// Destination exists but its inbound queue is at capacity
    #[error("Queue full: {0}")]
    Full(QueueId, Message),

    /// Destination does not exist or has gone away
    #[error("Queue unavailable: {0}")]
    Unavailable(QueueId, Message),
}

impl SendError {
    pub fn queue(&self) -> QueueId {
        match self {
            SendError::Full(queue, _) | SendError::Unavailable(queue, _) => *queue,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            SendError::Full(_, message) | SendError::Unavailable(_, message) => message,
        }
    }
}

/// Non-blocking delivery of a message to a queue
pub trait Transport: Send + Sync {
    fn try_send(&self, queue: QueueId, message: Message) -> Result<(), SendError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn try_send(&self, queue: QueueId, message: Message) -> Result<(), SendError> {
        (**self).try_send(queue, message)
    }
}
