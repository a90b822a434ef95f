//! Pending and persistent requests
//!
//! Two reasons keep an outbound message from going out right away:
//!
//! - *pending*: the destination cannot take it now (its queue is full or every
//!   instance of the resource is busy). It is retried on every drain.
//! - *persistent*: it announces a decision that is not durable yet. It is
//!   held until the journal has been flushed, then released.
//!
//! Delivery is always attempted without blocking, one request at a time, so a
//! slow participant never holds up the others.

use crate::resource::InstanceId;
use tmx_common::{QueueId, ResourceId, Xid};
use tmx_transport::{Message, SendError, Transport};

/// Where a request is going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A participant, resolved to a concrete queue at send time
    Resource { resource: ResourceId, xid: Xid },
    /// A caller waiting for its reply
    Reply(QueueId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target: Target,
    pub message: Message,
}

impl Request {
    pub fn resource(resource: ResourceId, xid: Xid, message: Message) -> Self {
        Self {
            target: Target::Resource { resource, xid },
            message,
        }
    }

    pub fn reply(queue: QueueId, message: Message) -> Self {
        Self {
            target: Target::Reply(queue),
            message,
        }
    }
}

/// Resolution of a target at send time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Ready {
        queue: QueueId,
        instance: Option<InstanceId>,
    },
    /// Nobody can take it right now
    Busy,
    /// The target no longer exists
    Gone,
}

/// Resolves targets to queues and learns which sends went through
pub trait Router {
    fn route(&mut self, target: &Target) -> Route;

    fn delivered(&mut self, target: &Target, instance: Option<InstanceId>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Deferred,
    /// The destination is gone; the request comes back to the caller
    Failed(Request),
}

enum Attempt {
    Sent,
    Retry(Request),
    Failed(Request),
}

pub struct RequestQueue {
    pending: Vec<Request>,
    persistent: Vec<Request>,
    batch_size: usize,
}

impl RequestQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            persistent: Vec::new(),
            batch_size: batch_size.max(1),
        }
    }

    fn attempt<T, R>(transport: &T, router: &mut R, request: Request) -> Attempt
    where
        T: Transport + ?Sized,
        R: Router + ?Sized,
    {
        let Request { target, message } = request;
        match router.route(&target) {
            Route::Gone => Attempt::Failed(Request { target, message }),
            Route::Busy => Attempt::Retry(Request { target, message }),
            Route::Ready { queue, instance } => match transport.try_send(queue, message) {
                Ok(()) => {
                    router.delivered(&target, instance);
                    Attempt::Sent
                }
                Err(SendError::Full(_, message)) => Attempt::Retry(Request { target, message }),
                Err(SendError::Unavailable(queue, message)) => {
                    tracing::error!("{} unavailable for {:?}", queue, target);
                    Attempt::Failed(Request { target, message })
                }
            },
        }
    }

    /// Send now if possible, otherwise keep the request for the next drain.
    /// A request is never dropped: it is sent, kept, or handed back.
    pub fn try_send_or_defer<T, R>(
        &mut self,
        transport: &T,
        router: &mut R,
        request: Request,
    ) -> Delivery
    where
        T: Transport + ?Sized,
        R: Router + ?Sized,
    {
        match Self::attempt(transport, router, request) {
            Attempt::Sent => Delivery::Sent,
            Attempt::Retry(request) => {
                tracing::debug!("deferring request for {:?}", request.target);
                self.pending.push(request);
                Delivery::Deferred
            }
            Attempt::Failed(request) => Delivery::Failed(request),
        }
    }

    /// Retry every pending request once, in order. Requests that still
    /// cannot go keep their relative order; requests whose destination is
    /// gone are returned.
    pub fn drain<T, R>(&mut self, transport: &T, router: &mut R) -> Vec<Request>
    where
        T: Transport + ?Sized,
        R: Router + ?Sized,
    {
        let mut failed = Vec::new();
        for request in std::mem::take(&mut self.pending) {
            match Self::attempt(transport, router, request) {
                Attempt::Sent => {}
                Attempt::Retry(request) => self.pending.push(request),
                Attempt::Failed(request) => failed.push(request),
            }
        }
        failed
    }

    /// Hold a request until the journal has been flushed
    pub fn defer_until_flush(&mut self, request: Request) {
        self.persistent.push(request);
    }

    /// The journal is flushed: send everything held for it. What cannot go
    /// right away becomes pending; requests whose destination is gone are
    /// returned.
    pub fn release_after_flush<T, R>(&mut self, transport: &T, router: &mut R) -> Vec<Request>
    where
        T: Transport + ?Sized,
        R: Router + ?Sized,
    {
        let mut failed = Vec::new();
        for request in std::mem::take(&mut self.persistent) {
            match self.try_send_or_defer(transport, router, request) {
                Delivery::Sent | Delivery::Deferred => {}
                Delivery::Failed(request) => failed.push(request),
            }
        }
        failed
    }

    /// Drop queued requests to `resource` for `xid`
    pub fn cancel(&mut self, xid: &Xid, resource: ResourceId) -> usize {
        let target = Target::Resource {
            resource,
            xid: *xid,
        };
        let before = self.pending.len() + self.persistent.len();
        self.pending.retain(|r| r.target != target);
        self.persistent.retain(|r| r.target != target);
        before - self.pending.len() - self.persistent.len()
    }

    /// A request for `resource` in `xid` is still waiting to go out
    pub fn holds(&self, xid: &Xid, resource: ResourceId) -> bool {
        let target = Target::Resource {
            resource,
            xid: *xid,
        };
        self.pending
            .iter()
            .chain(&self.persistent)
            .any(|r| r.target == target)
    }

    /// True once unflushed journal entries and held requests reach the batch
    /// size
    pub fn needs_flush(&self, unflushed: usize) -> bool {
        unflushed + self.persistent.len() >= self.batch_size
    }

    pub fn pending(&self) -> &[Request] {
        &self.pending
    }

    pub fn persistent(&self) -> &[Request] {
        &self.persistent
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.persistent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tmx_transport::MemoryTransport;

    /// Resources map straight to queues; busy and gone resources are listed
    #[derive(Default)]
    struct StaticRouter {
        queues: HashMap<ResourceId, QueueId>,
        busy: HashSet<ResourceId>,
        delivered: Vec<Target>,
    }

    impl Router for StaticRouter {
        fn route(&mut self, target: &Target) -> Route {
            match target {
                Target::Reply(queue) => Route::Ready {
                    queue: *queue,
                    instance: None,
                },
                Target::Resource { resource, .. } if self.busy.contains(resource) => Route::Busy,
                Target::Resource { resource, .. } => match self.queues.get(resource) {
                    Some(queue) => Route::Ready {
                        queue: *queue,
                        instance: None,
                    },
                    None => Route::Gone,
                },
            }
        }

        fn delivered(&mut self, target: &Target, _instance: Option<InstanceId>) {
            self.delivered.push(*target);
        }
    }

    fn message(tag: u8) -> Message {
        Message::with_body(vec![tag])
    }

    #[test]
    fn test_full_queue_defers_then_drains_once() {
        let transport = MemoryTransport::new();
        let (queue, mut rx) = transport.open_queue(1);
        let mut router = StaticRouter::default();
        router.queues.insert(ResourceId(1), queue);
        let mut requests = RequestQueue::new(100);
        let xid = Xid::new();

        let first = requests.try_send_or_defer(
            &transport,
            &mut router,
            Request::resource(ResourceId(1), xid, message(1)),
        );
        let second = requests.try_send_or_defer(
            &transport,
            &mut router,
            Request::resource(ResourceId(1), xid, message(2)),
        );
        assert_eq!(first, Delivery::Sent);
        assert_eq!(second, Delivery::Deferred);
        assert_eq!(requests.pending().len(), 1);

        // Still full
        assert!(requests.drain(&transport, &mut router).is_empty());
        assert_eq!(requests.pending().len(), 1);

        assert_eq!(rx.try_recv().unwrap().body, vec![1]);
        assert!(requests.drain(&transport, &mut router).is_empty());
        assert!(requests.pending().is_empty());
        assert_eq!(rx.try_recv().unwrap().body, vec![2]);
        assert!(rx.try_recv().is_err());

        requests.drain(&transport, &mut router);
        assert!(rx.try_recv().is_err());
        assert_eq!(router.delivered.len(), 2);
    }

    #[test]
    fn test_drain_preserves_order() {
        let transport = MemoryTransport::new();
        let (queue, mut rx) = transport.open_queue(8);
        let mut router = StaticRouter::default();
        router.queues.insert(ResourceId(1), queue);
        router.queues.insert(ResourceId(2), queue);
        router.busy.insert(ResourceId(1));
        router.busy.insert(ResourceId(2));

        let mut requests = RequestQueue::new(100);
        let xid = Xid::new();
        for (tag, resource) in [(1, 1), (2, 2), (3, 1), (4, 2)] {
            let delivery = requests.try_send_or_defer(
                &transport,
                &mut router,
                Request::resource(ResourceId(resource), xid, message(tag)),
            );
            assert_eq!(delivery, Delivery::Deferred);
        }

        router.busy.remove(&ResourceId(2));
        requests.drain(&transport, &mut router);

        let tags: Vec<u8> = requests.pending().iter().map(|r| r.message.body[0]).collect();
        assert_eq!(tags, vec![1, 3]);
        assert_eq!(rx.try_recv().unwrap().body, vec![2]);
        assert_eq!(rx.try_recv().unwrap().body, vec![4]);
    }

    #[test]
    fn test_gone_target_is_returned() {
        let transport = MemoryTransport::new();
        let mut router = StaticRouter::default();
        let mut requests = RequestQueue::new(100);
        let xid = Xid::new();

        let delivery = requests.try_send_or_defer(
            &transport,
            &mut router,
            Request::resource(ResourceId(7), xid, message(1)),
        );
        assert!(matches!(delivery, Delivery::Failed(r) if r.message.body == vec![1]));
        assert!(requests.is_empty());

        // A closed reply queue is unavailable, not deferred
        let delivery = requests.try_send_or_defer(
            &transport,
            &mut router,
            Request::reply(QueueId(55), message(2)),
        );
        assert!(matches!(delivery, Delivery::Failed(_)));
    }

    #[test]
    fn test_persistent_waits_for_release() {
        let transport = MemoryTransport::new();
        let (queue, mut rx) = transport.open_queue(1);
        let mut router = StaticRouter::default();
        router.queues.insert(ResourceId(1), queue);
        let mut requests = RequestQueue::new(100);
        let xid = Xid::new();

        requests.defer_until_flush(Request::resource(ResourceId(1), xid, message(1)));
        requests.defer_until_flush(Request::resource(ResourceId(1), xid, message(2)));
        requests.drain(&transport, &mut router);
        assert!(rx.try_recv().is_err());
        assert_eq!(requests.persistent().len(), 2);

        let failed = requests.release_after_flush(&transport, &mut router);
        assert!(failed.is_empty());
        assert!(requests.persistent().is_empty());
        // Capacity one: the second became pending
        assert_eq!(requests.pending().len(), 1);
        assert_eq!(rx.try_recv().unwrap().body, vec![1]);
    }

    #[test]
    fn test_needs_flush_at_batch_size() {
        let mut requests = RequestQueue::new(3);
        assert!(!requests.needs_flush(2));
        assert!(requests.needs_flush(3));

        requests.defer_until_flush(Request::reply(QueueId(1), message(1)));
        assert!(requests.needs_flush(2));
    }

    #[test]
    fn test_cancel() {
        let mut requests = RequestQueue::new(100);
        let transport = MemoryTransport::new();
        let mut router = StaticRouter::default();
        router.busy.insert(ResourceId(1));
        let xid = Xid::new();
        let other = Xid::new();

        requests.try_send_or_defer(
            &transport,
            &mut router,
            Request::resource(ResourceId(1), xid, message(1)),
        );
        requests.try_send_or_defer(
            &transport,
            &mut router,
            Request::resource(ResourceId(1), other, message(2)),
        );
        requests.defer_until_flush(Request::resource(ResourceId(1), xid, message(3)));

        assert!(requests.holds(&xid, ResourceId(1)));
        assert!(!requests.holds(&xid, ResourceId(2)));

        assert_eq!(requests.cancel(&xid, ResourceId(1)), 2);
        assert!(!requests.holds(&xid, ResourceId(1)));
        assert!(requests.holds(&other, ResourceId(1)));
        assert_eq!(requests.pending().len(), 1);
        assert!(requests.persistent().is_empty());
    }
}
