//! In-process transport
//!
//! Every queue is a bounded tokio channel. The bound stands in for the
//! capacity of a real inter-process queue, so saturation can be produced
//! deliberately in tests.

use crate::{Message, SendError, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tmx_common::QueueId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Transport that delivers to in-memory channels
pub struct MemoryTransport {
    queues: Mutex<HashMap<QueueId, mpsc::Sender<Message>>>,
    next_queue: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_queue: AtomicU64::new(1),
        }
    }

    /// Open a queue holding at most `capacity` undelivered messages
    pub fn open_queue(&self, capacity: usize) -> (QueueId, mpsc::Receiver<Message>) {
        let queue = QueueId(self.next_queue.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.queues.lock().insert(queue, tx);
        tracing::debug!("opened {} with capacity {}", queue, capacity.max(1));
        (queue, rx)
    }

    /// Remove a queue; later sends to it fail as unavailable
    pub fn close_queue(&self, queue: QueueId) {
        if self.queues.lock().remove(&queue).is_some() {
            tracing::debug!("closed {}", queue);
        }
    }

    pub fn is_open(&self, queue: QueueId) -> bool {
        self.queues.lock().contains_key(&queue)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn try_send(&self, queue: QueueId, message: Message) -> Result<(), SendError> {
        let sender = match self.queues.lock().get(&queue) {
            Some(sender) => sender.clone(),
            None => return Err(SendError::Unavailable(queue, message)),
        };

        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => Err(SendError::Full(queue, message)),
            Err(TrySendError::Closed(message)) => {
                self.queues.lock().remove(&queue);
                Err(SendError::Unavailable(queue, message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_receive() {
        let transport = MemoryTransport::new();
        let (queue, mut rx) = transport.open_queue(4);

        transport
            .try_send(queue, Message::with_body(b"hello".to_vec()))
            .unwrap();

        let received = rx.try_recv().unwrap();
        assert_eq!(received.body, b"hello");
    }

    #[test]
    fn test_full_queue_returns_message() {
        let transport = MemoryTransport::new();
        let (queue, mut rx) = transport.open_queue(1);

        transport.try_send(queue, Message::with_body(vec![1])).unwrap();

        let err = transport
            .try_send(queue, Message::with_body(vec![2]))
            .unwrap_err();
        assert!(matches!(err, SendError::Full(q, _) if q == queue));
        assert_eq!(err.into_message().body, vec![2]);

        // Room again once the receiver catches up
        rx.try_recv().unwrap();
        transport.try_send(queue, Message::with_body(vec![3])).unwrap();
        assert_eq!(rx.try_recv().unwrap().body, vec![3]);
    }

    #[test]
    fn test_unknown_and_closed_queues() {
        let transport = MemoryTransport::new();

        let err = transport
            .try_send(QueueId(999), Message::with_body(vec![]))
            .unwrap_err();
        assert!(matches!(err, SendError::Unavailable(QueueId(999), _)));

        let (queue, rx) = transport.open_queue(1);
        drop(rx);
        let err = transport.try_send(queue, Message::with_body(vec![])).unwrap_err();
        assert!(matches!(err, SendError::Unavailable(..)));
        assert!(!transport.is_open(queue));

        let (queue, _rx) = transport.open_queue(1);
        transport.close_queue(queue);
        assert!(transport.try_send(queue, Message::with_body(vec![])).is_err());
    }

    #[test]
    fn test_headers() {
        let message = Message::with_body(vec![]).with_header("type", "commit");
        assert_eq!(message.get_header("type"), Some("commit"));
        assert_eq!(message.get_header("missing"), None);
    }
}
