use std::sync::Arc;
use std::time::Duration;
use tmx_common::{Flags, Outcome, Pid, ProcessHandle, QueueId, ResourceId, Xid};
use tmx_coordinator::{Coordinator, CoordinatorConfig, ProxyConfig, ResourceProperty, ResourceRegistry};
use tmx_journal::{Caller, Decision, DecisionRecord, Journal, JournalEntry};
use tmx_journal_memory::MemoryJournal;
use tmx_protocol::{
    Inbound, InvolvedRequest, Phase, RequestKind, ResourceReady, ResourceReply, ResourceRequest,
    TransactionReply, TransactionRequest,
};
use tmx_runner::{Runner, RunnerError};
use tmx_transport::{MemoryTransport, Message, Transport};
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

struct Endpoint {
    process: ProcessHandle,
    rx: Receiver<Message>,
}

impl Endpoint {
    fn open(transport: &MemoryTransport, pid: u32) -> Self {
        let (queue, rx) = transport.open_queue(16);
        Self {
            process: ProcessHandle::new(Pid(pid), queue),
            rx,
        }
    }

    async fn next(&mut self) -> Message {
        timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("nothing received in time")
            .expect("queue closed")
    }

    async fn request(&mut self) -> ResourceRequest {
        ResourceRequest::from_message(&self.next().await).unwrap()
    }

    async fn reply(&mut self) -> TransactionReply {
        TransactionReply::from_message(&self.next().await).unwrap()
    }
}

struct Node {
    transport: Arc<MemoryTransport>,
    inbox: QueueId,
    handle: JoinHandle<tmx_runner::Result<()>>,
}

impl Node {
    fn send(&self, inbound: Inbound) {
        self.transport
            .try_send(self.inbox, inbound.into_message().unwrap())
            .unwrap();
    }

    async fn stop(self) -> tmx_runner::Result<()> {
        self.send(Inbound::Shutdown);
        timeout(Duration::from_secs(2), self.handle)
            .await
            .expect("runner did not stop")
            .unwrap()
    }
}

/// Start a runner with `proxies` single-instance resources named db1, db2...
fn start(
    transport: &Arc<MemoryTransport>,
    journal: MemoryJournal,
    proxies: usize,
    config: CoordinatorConfig,
) -> (Node, Vec<ResourceId>) {
    let mut registry = ResourceRegistry::new([ResourceProperty {
        key: "db".to_string(),
        server: "rm-proxy-db".to_string(),
        xa_switch: "db_xa_switch".to_string(),
    }]);
    let ids = (0..proxies)
        .map(|n| {
            registry
                .register_proxy(ProxyConfig::new(format!("db{}", n + 1), "db"))
                .unwrap()
        })
        .collect();

    let (inbox, rx) = transport.open_queue(64);
    let coordinator = Coordinator::new(
        ProcessHandle::new(Pid(1), inbox),
        config,
        registry,
        transport.clone(),
        journal,
    );
    let handle = tokio::spawn(Runner::new(coordinator, rx).run());

    let node = Node {
        transport: transport.clone(),
        inbox,
        handle,
    };
    (node, ids)
}

fn ready(node: &Node, proxy: &Endpoint, resource: ResourceId) {
    node.send(Inbound::ResourceReady(ResourceReady {
        process: proxy.process,
        resource,
        code: Outcome::Ok.code(),
    }));
}

fn answer(node: &Node, proxy: &Endpoint, resource: ResourceId, xid: Xid, phase: Phase) {
    node.send(Inbound::ResourceReply(ResourceReply {
        process: proxy.process,
        resource,
        xid,
        phase,
        code: Outcome::Ok.code(),
    }));
}

fn commit(node: &Node, caller: &Endpoint, xid: Xid) -> Uuid {
    let correlation = Uuid::now_v7();
    node.send(Inbound::Commit(TransactionRequest {
        process: caller.process,
        correlation,
        xid,
        resource: ResourceId(0),
        flags: Flags::NO_FLAGS,
    }));
    correlation
}

#[tokio::test]
async fn test_commit_through_runner() {
    let transport = Arc::new(MemoryTransport::new());
    let journal = MemoryJournal::new();
    let (node, ids) = start(&transport, journal.reopen(), 2, CoordinatorConfig::default());

    let mut proxies: Vec<Endpoint> = (0..2).map(|n| Endpoint::open(&transport, 100 + n)).collect();
    let mut caller = Endpoint::open(&transport, 50);
    for (proxy, id) in proxies.iter().zip(&ids) {
        ready(&node, proxy, *id);
    }

    let xid = Xid::new();
    node.send(Inbound::Involved(InvolvedRequest {
        process: caller.process,
        xid,
        resources: ids.clone(),
        correlation: None,
    }));
    let correlation = commit(&node, &caller, xid);

    for (proxy, id) in proxies.iter_mut().zip(&ids) {
        let request = proxy.request().await;
        assert_eq!(request.phase, Phase::Prepare);
        assert_eq!(request.xid, xid);
        answer(&node, proxy, *id, xid, Phase::Prepare);
    }
    // Commit goes out only once the decision is flushed, which the runner
    // does on its own
    for (proxy, id) in proxies.iter_mut().zip(&ids) {
        let request = proxy.request().await;
        assert_eq!(request.phase, Phase::Commit);
        answer(&node, proxy, *id, xid, Phase::Commit);
    }

    let reply = caller.reply().await;
    assert_eq!(reply.kind, RequestKind::Commit);
    assert_eq!(reply.correlation, correlation);
    assert_eq!(reply.outcome, Outcome::Ok);

    node.stop().await.unwrap();
    assert!(journal.outstanding().unwrap().is_empty());
}

#[tokio::test]
async fn test_participant_timeout_fires_while_idle() {
    let transport = Arc::new(MemoryTransport::new());
    let config = CoordinatorConfig::default().with_reply_timeout(Duration::from_millis(50));
    let (node, ids) = start(&transport, MemoryJournal::new(), 1, config);

    let mut proxy = Endpoint::open(&transport, 100);
    let mut caller = Endpoint::open(&transport, 50);
    ready(&node, &proxy, ids[0]);

    let xid = Xid::new();
    node.send(Inbound::Involved(InvolvedRequest {
        process: caller.process,
        xid,
        resources: ids.clone(),
        correlation: None,
    }));
    node.send(Inbound::Rollback(TransactionRequest {
        process: caller.process,
        correlation: Uuid::now_v7(),
        xid,
        resource: ResourceId(0),
        flags: Flags::NO_FLAGS,
    }));

    assert_eq!(proxy.request().await.phase, Phase::Rollback);
    // Never answered: the deadline alone has to wake the runner
    let reply = caller.reply().await;
    assert_eq!(reply.kind, RequestKind::Rollback);
    assert_eq!(reply.outcome, Outcome::ResourceError);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_recovery_on_start() {
    let transport = Arc::new(MemoryTransport::new());
    let journal = MemoryJournal::new();
    let mut caller = Endpoint::open(&transport, 50);
    let xid = Xid::new();
    let correlation = Uuid::now_v7();

    let mut seed = journal.reopen();
    seed.append(JournalEntry::Decision(DecisionRecord {
        xid,
        decision: Decision::Commit,
        outcome: Outcome::Ok,
        participants: vec![ResourceId(1)],
        caller: Some(Caller {
            process: caller.process,
            correlation,
            resource: ResourceId(0),
            requested: Decision::Commit,
        }),
    }))
    .unwrap();
    seed.flush().unwrap();

    let (node, ids) = start(&transport, journal.reopen(), 1, CoordinatorConfig::default());
    assert_eq!(ids[0], ResourceId(1));

    let mut proxy = Endpoint::open(&transport, 100);
    ready(&node, &proxy, ids[0]);

    let request = proxy.request().await;
    assert_eq!(request.phase, Phase::Commit);
    assert_eq!(request.xid, xid);
    answer(&node, &proxy, ids[0], xid, Phase::Commit);

    let reply = caller.reply().await;
    assert_eq!(reply.correlation, correlation);
    assert_eq!(reply.outcome, Outcome::Ok);

    node.stop().await.unwrap();
    assert!(journal.outstanding().unwrap().is_empty());
}

#[tokio::test]
async fn test_closed_inbound_queue_is_an_error() {
    let transport = Arc::new(MemoryTransport::new());
    let (node, _) = start(&transport, MemoryJournal::new(), 1, CoordinatorConfig::default());

    transport.close_queue(node.inbox);
    let result = timeout(Duration::from_secs(2), node.handle)
        .await
        .expect("runner did not stop")
        .unwrap();
    assert!(matches!(result, Err(RunnerError::InboundClosed)));
}

#[tokio::test]
async fn test_garbage_does_not_stop_runner() {
    let transport = Arc::new(MemoryTransport::new());
    let (node, _) = start(&transport, MemoryJournal::new(), 1, CoordinatorConfig::default());

    transport
        .try_send(node.inbox, Message::with_body(b"not a message".to_vec()))
        .unwrap();
    node.stop().await.unwrap();
}
