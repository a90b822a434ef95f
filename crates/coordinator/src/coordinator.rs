//! Two-phase commit driver
//!
//! The coordinator consumes one inbound message at a time and owns every
//! piece of state involved: the resource and transaction registries, the open
//! correlations and the deferred requests. Nothing in here blocks; sends are
//! attempted without waiting and replies arrive as later messages.

use crate::config::CoordinatorConfig;
use crate::correlation::{CorrelationTracker, Origin, ParticipantState, Progress, ReplyTo};
use crate::error::{CoordinatorError, Result};
use crate::pending::{Delivery, Request, RequestQueue, Route, Router, Target};
use crate::resource::{InstanceId, ResourceRegistry, Statistics};
use crate::transaction::{Lookup, Stage, TransactionRegistry};
use std::sync::Arc;
use std::time::Instant;
use tmx_common::{Flags, Outcome, ProcessHandle, ResourceId, Xid};
use tmx_journal::{Caller, Decision, DecisionRecord, Journal, JournalEntry};
use tmx_protocol::{
    Inbound, InvolvedRequest, Phase, ProcessExit, RequestKind, ResourceReady, ResourceReply,
    ResourceRequest, TransactionReply, TransactionRequest,
};
use tmx_transport::{Message, Transport};

/// What became of one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Processed,
    /// The message could not be decoded
    Discarded,
    Shutdown,
}

/// Routes resource requests to an idle proxy instance or an external
/// resource's own queue, and marks instances busy once they have been
/// handed a request.
struct Dispatch<'a> {
    resources: &'a mut ResourceRegistry,
    now: Instant,
}

impl Router for Dispatch<'_> {
    fn route(&mut self, target: &Target) -> Route {
        match target {
            Target::Reply(queue) => Route::Ready {
                queue: *queue,
                instance: None,
            },
            Target::Resource { resource, .. } if resource.is_external() => {
                match self.resources.external(*resource) {
                    Some(external) => Route::Ready {
                        queue: external.process.queue,
                        instance: None,
                    },
                    None => Route::Gone,
                }
            }
            Target::Resource { resource, .. } => {
                if self.resources.proxy(*resource).is_none() {
                    return Route::Gone;
                }
                match self
                    .resources
                    .find_idle_instance(*resource)
                    .and_then(|id| self.resources.instance(id))
                {
                    Some(instance) => Route::Ready {
                        queue: instance.process.queue,
                        instance: Some(instance.id),
                    },
                    None => Route::Busy,
                }
            }
        }
    }

    fn delivered(&mut self, target: &Target, instance: Option<InstanceId>) {
        if let (Target::Resource { xid, .. }, Some(id)) = (target, instance) {
            if let Err(err) = self.resources.mark_busy(id, *xid, self.now) {
                tracing::warn!("[{}] {}", xid, err);
            }
        }
    }
}

fn requested(phase: Phase) -> Stage {
    match phase {
        Phase::Prepare => Stage::PrepareRequested,
        Phase::Commit => Stage::CommitRequested,
        Phase::Rollback => Stage::RollbackRequested,
    }
}

fn replied(phase: Phase) -> Stage {
    match phase {
        Phase::Prepare => Stage::PrepareReplied,
        Phase::Commit => Stage::CommitReplied,
        Phase::Rollback => Stage::RollbackReplied,
    }
}

fn reply_to(request: &TransactionRequest, kind: RequestKind) -> ReplyTo {
    ReplyTo {
        process: request.process,
        correlation: request.correlation,
        resource: request.resource,
        kind,
    }
}

fn reply_request(reply: &ReplyTo, xid: Xid, outcome: Outcome) -> Result<Request> {
    tracing::debug!(
        "[{}] replying {} to {:?} from {}",
        xid,
        outcome,
        reply.kind,
        reply.process
    );
    let message = TransactionReply {
        kind: reply.kind,
        correlation: reply.correlation,
        xid,
        resource: reply.resource,
        outcome,
    }
    .into_message()?;
    Ok(Request::reply(reply.process.queue, message))
}

/// Transaction manager of one domain
pub struct Coordinator<T: Transport, J: Journal> {
    /// Where participants send their replies
    pub(crate) identity: ProcessHandle,
    config: CoordinatorConfig,
    transport: Arc<T>,
    pub(crate) journal: J,
    pub(crate) resources: ResourceRegistry,
    pub(crate) transactions: TransactionRegistry,
    pub(crate) correlations: CorrelationTracker,
    pub(crate) requests: RequestQueue,
}

impl<T: Transport, J: Journal> Coordinator<T, J> {
    pub fn new(
        identity: ProcessHandle,
        config: CoordinatorConfig,
        resources: ResourceRegistry,
        transport: Arc<T>,
        journal: J,
    ) -> Self {
        let requests = RequestQueue::new(config.batch_size);
        Self {
            identity,
            config,
            transport,
            journal,
            resources,
            transactions: TransactionRegistry::new(),
            correlations: CorrelationTracker::new(),
            requests,
        }
    }

    pub fn identity(&self) -> ProcessHandle {
        self.identity
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.resources
    }

    pub fn transactions(&self) -> &TransactionRegistry {
        &self.transactions
    }

    pub fn correlations(&self) -> &CorrelationTracker {
        &self.correlations
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    /// Round trip statistics of a configured resource
    pub fn statistics(&self, resource: ResourceId) -> Option<Statistics> {
        self.resources.proxy_statistics(resource)
    }

    /// Deferred work exists: unflushed log entries or requests not sent yet
    pub fn outstanding(&self) -> bool {
        !self.requests.is_empty() || self.journal.unflushed() > 0
    }

    /// Earliest participant deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.correlations.next_deadline()
    }

    // === INBOUND ===

    /// Decode and handle a raw message. Messages that cannot be decoded are
    /// logged and dropped.
    pub fn handle_message(&mut self, message: &Message) -> Result<Handled> {
        match Inbound::from_message(message) {
            Ok(inbound) => self.handle(inbound),
            Err(err) => {
                tracing::warn!("discarding message: {}", err);
                Ok(Handled::Discarded)
            }
        }
    }

    pub fn handle(&mut self, inbound: Inbound) -> Result<Handled> {
        self.handle_at(inbound, Instant::now())
    }

    /// Handle one message as of `now`. Only journal failures are returned as
    /// errors; everything else is answered or logged.
    pub fn handle_at(&mut self, inbound: Inbound, now: Instant) -> Result<Handled> {
        tracing::trace!("handling {}", inbound.kind());

        match inbound {
            Inbound::Commit(request) => self.commit(request, now)?,
            Inbound::Rollback(request) => self.rollback(request, now)?,
            Inbound::Prepare(request) => self.prepare(request, now)?,
            Inbound::Involved(request) => self.involved(request, now)?,
            Inbound::ResourceReply(reply) => self.resource_reply(reply, now)?,
            Inbound::ResourceReady(ready) => self.resource_ready(ready)?,
            Inbound::ProcessExit(exit) => self.process_exit(exit, now)?,
            Inbound::Shutdown => {
                tracing::info!("shutting down");
                self.resources.shutdown_all();
                return Ok(Handled::Shutdown);
            }
        }

        if self.requests.needs_flush(self.journal.unflushed()) {
            self.flush_at(now)?;
        }
        Ok(Handled::Processed)
    }

    /// Commit requested by the transaction's owner, or phase two of a
    /// transaction prepared on behalf of another domain
    fn commit(&mut self, request: TransactionRequest, now: Instant) -> Result<()> {
        let xid = self.resolve(&request.xid);
        let reply = reply_to(&request, RequestKind::Commit);

        let resources = match self.transactions.resources_for(&xid) {
            Lookup::Unknown => {
                tracing::info!("[{}] commit of unknown transaction", xid);
                return self.reply(&reply, xid, Outcome::NotFound, now);
            }
            Lookup::Empty => {
                self.transactions.remove(&xid);
                return self.reply(&reply, xid, Outcome::ReadOnly, now);
            }
            Lookup::Found(resources) => resources,
        };

        if self.correlations.contains(&xid) {
            tracing::warn!("[{}] commit while another request is in progress", xid);
            return self.reply(&reply, xid, Outcome::Protocol, now);
        }

        match self.stage_of(&xid) {
            Stage::PrepareReplied => {
                let prepared = self.in_stage(&xid, Stage::PrepareReplied);
                self.start_round(
                    xid,
                    reply,
                    Origin::Domain,
                    Phase::Commit,
                    &prepared,
                    request.flags,
                    now,
                )
            }
            // A peer domain may only skip prepare by asking for one phase
            Stage::Involved
                if request.from_domain() && !request.flags.contains(Flags::ONE_PHASE) =>
            {
                tracing::warn!("[{}] commit from a peer domain before prepare", xid);
                self.reply(&reply, xid, Outcome::Protocol, now)
            }
            Stage::Involved if resources.len() == 1 => {
                tracing::debug!("[{}] one-phase commit", xid);
                self.start_round(
                    xid,
                    reply,
                    Origin::Owner,
                    Phase::Commit,
                    &resources,
                    request.flags | Flags::ONE_PHASE,
                    now,
                )
            }
            Stage::Involved => self.start_round(
                xid,
                reply,
                Origin::Owner,
                Phase::Prepare,
                &resources,
                Flags::NO_FLAGS,
                now,
            ),
            stage => {
                tracing::warn!("[{}] commit in stage {:?}", xid, stage);
                self.reply(&reply, xid, Outcome::Protocol, now)
            }
        }
    }

    fn rollback(&mut self, request: TransactionRequest, now: Instant) -> Result<()> {
        let xid = self.resolve(&request.xid);
        let reply = reply_to(&request, RequestKind::Rollback);

        match self.transactions.resources_for(&xid) {
            Lookup::Unknown => {
                tracing::info!("[{}] rollback of unknown transaction", xid);
                return self.reply(&reply, xid, Outcome::NotFound, now);
            }
            Lookup::Empty => {
                self.transactions.remove(&xid);
                return self.reply(&reply, xid, Outcome::Ok, now);
            }
            Lookup::Found(_) => {}
        }

        if self.correlations.contains(&xid) {
            tracing::warn!("[{}] rollback while another request is in progress", xid);
            return self.reply(&reply, xid, Outcome::Protocol, now);
        }

        match self.stage_of(&xid) {
            Stage::PrepareReplied => {
                let prepared = self.in_stage(&xid, Stage::PrepareReplied);
                self.start_round(
                    xid,
                    reply,
                    Origin::Domain,
                    Phase::Rollback,
                    &prepared,
                    request.flags,
                    now,
                )
            }
            Stage::Involved => {
                let involved = self.in_stage(&xid, Stage::Involved);
                let deadline = self.deadline(now);
                self.correlations.open(
                    xid,
                    Some(reply.clone()),
                    Origin::Owner,
                    Phase::Rollback,
                    &involved,
                    deadline,
                )?;
                self.log_decision(xid, Decision::Rollback, Outcome::Ok, &involved, Some(&reply))?;
                self.fan_out(xid, Phase::Rollback, &involved, request.flags, now, true)
            }
            stage => {
                tracing::warn!("[{}] rollback in stage {:?}", xid, stage);
                self.reply(&reply, xid, Outcome::Protocol, now)
            }
        }
    }

    /// Another domain's transaction manager asks us to prepare our branch
    fn prepare(&mut self, request: TransactionRequest, now: Instant) -> Result<()> {
        let xid = self.resolve(&request.xid);
        let reply = reply_to(&request, RequestKind::Prepare);

        let resources = match self.transactions.resources_for(&xid) {
            Lookup::Unknown | Lookup::Empty => {
                tracing::debug!("[{}] nothing to prepare", xid);
                self.transactions.remove(&xid);
                return self.reply(&reply, xid, Outcome::ReadOnly, now);
            }
            Lookup::Found(resources) => resources,
        };

        if self.correlations.contains(&xid) || self.stage_of(&xid) != Stage::Involved {
            tracing::warn!("[{}] prepare of a transaction already in progress", xid);
            return self.reply(&reply, xid, Outcome::Protocol, now);
        }

        self.start_round(
            xid,
            reply,
            Origin::Domain,
            Phase::Prepare,
            &resources,
            request.flags,
            now,
        )
    }

    fn involved(&mut self, request: InvolvedRequest, now: Instant) -> Result<()> {
        let xid = request.xid;

        let resources: Vec<ResourceId> = if request.resources.is_empty() {
            vec![self.resources.register_external(request.process)]
        } else {
            request
                .resources
                .iter()
                .copied()
                .filter(|resource| {
                    let known = self.resources.contains(*resource);
                    if !known {
                        tracing::error!("[{}] involvement of unknown resource {}", xid, resource);
                    }
                    known
                })
                .collect()
        };

        let open = !self.correlations.contains(&xid)
            && self
                .transactions
                .get(&xid)
                .is_none_or(|t| matches!(t.stage(), Stage::Involved | Stage::NotInvolved));

        let outcome = if !open {
            tracing::warn!("[{}] involvement after commit processing started", xid);
            Outcome::Protocol
        } else if resources.is_empty() {
            Outcome::InvalidArgument
        } else {
            for resource in &resources {
                self.transactions.mark_involved(xid, *resource, request.process);
            }
            Outcome::Ok
        };

        if let Some(correlation) = request.correlation {
            let reply = ReplyTo {
                process: request.process,
                correlation,
                resource: resources.first().copied().unwrap_or(ResourceId(0)),
                kind: RequestKind::Involved,
            };
            self.reply(&reply, xid, outcome, now)?;
        }
        Ok(())
    }

    fn resource_reply(&mut self, reply: ResourceReply, now: Instant) -> Result<()> {
        let xid = reply.xid;
        let resource = reply.resource;
        let outcome = Outcome::from_code(reply.code);

        if !resource.is_external() {
            match self.resources.instance_of(reply.process.pid, resource) {
                Some(id) => {
                    self.resources.mark_idle(id, now)?;
                }
                None => tracing::warn!(
                    "[{}] reply from {} which is not an instance of {}",
                    xid,
                    reply.process,
                    resource
                ),
            }
        }

        let Some(correlation) = self.correlations.get(&xid) else {
            tracing::warn!("[{}] {} replied with nothing in progress", xid, resource);
            return Ok(());
        };
        if correlation.phase != reply.phase {
            tracing::warn!(
                "[{}] {} replied to {} during {}",
                xid,
                resource,
                reply.phase.as_str(),
                correlation.phase.as_str()
            );
            return Ok(());
        }
        if !self.awaits(&xid, resource) {
            tracing::warn!("[{}] unexpected reply from {}", xid, resource);
            return Ok(());
        }

        tracing::debug!(
            "[{}] {} replied {} to {}",
            xid,
            resource,
            outcome,
            reply.phase.as_str()
        );
        self.advance(&xid, resource, replied(reply.phase), outcome);

        match self.correlations.record_reply(&xid, resource, outcome) {
            Progress::Complete => self.complete(xid, now),
            Progress::Waiting | Progress::Ignored => Ok(()),
        }
    }

    fn resource_ready(&mut self, ready: ResourceReady) -> Result<()> {
        match self.resources.attach_instance(ready.resource, ready.process) {
            Ok(id) => {
                if Outcome::from_code(ready.code) == Outcome::Ok {
                    tracing::info!("[{}] {} ready ({})", ready.resource, id, ready.process);
                } else {
                    self.resources.mark_startup_error(id)?;
                }
            }
            Err(err) => tracing::error!(
                "[{}] ready announcement from {}: {}",
                ready.resource,
                ready.process,
                err
            ),
        }
        Ok(())
    }

    fn process_exit(&mut self, exit: ProcessExit, now: Instant) -> Result<()> {
        tracing::debug!("process {} exited: {:?}", exit.pid, exit.reason);

        for detached in self.resources.detach_on_exit(exit.pid) {
            let resource = detached.resource;
            if let Some(xid) = detached.in_flight {
                self.fail(xid, resource, now)?;
            }
            // Any request already handed out that no live instance is
            // serving will never be answered
            for xid in self.correlations.pending_on(resource) {
                let orphaned = detached.instance.is_none()
                    || !(self.requests.holds(&xid, resource)
                        || self.resources.serving(resource, &xid));
                if orphaned {
                    self.fail(xid, resource, now)?;
                }
            }
        }
        Ok(())
    }

    // === TIMERS AND DURABILITY ===

    /// Fail every participant whose reply is overdue
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        for (xid, resource) in self.correlations.expired(now) {
            tracing::warn!("[{}] {} did not reply in time", xid, resource);
            self.fail(xid, resource, now)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_at(Instant::now())
    }

    /// Make the log durable, then release everything that waited for it
    pub fn flush_at(&mut self, now: Instant) -> Result<()> {
        if self.journal.unflushed() == 0 && self.requests.persistent().is_empty() {
            return Ok(());
        }

        self.journal.flush()?;

        let mut router = Dispatch {
            resources: &mut self.resources,
            now,
        };
        let failed = self
            .requests
            .release_after_flush(self.transport.as_ref(), &mut router);
        for request in failed {
            self.undeliverable(request, now)?;
        }
        Ok(())
    }

    pub fn drain(&mut self) -> Result<()> {
        self.drain_at(Instant::now())
    }

    /// Retry every pending request once
    pub fn drain_at(&mut self, now: Instant) -> Result<()> {
        let mut router = Dispatch {
            resources: &mut self.resources,
            now,
        };
        let failed = self.requests.drain(self.transport.as_ref(), &mut router);
        for request in failed {
            self.undeliverable(request, now)?;
        }
        Ok(())
    }

    // === ROUNDS ===

    /// The aggregate is known: act on it
    pub(crate) fn complete(&mut self, xid: Xid, now: Instant) -> Result<()> {
        let Some(correlation) = self.correlations.get(&xid) else {
            return Ok(());
        };
        match (correlation.origin, correlation.phase) {
            (_, Phase::Commit | Phase::Rollback) => self.finish(xid, now),
            (Origin::Domain, Phase::Prepare) => self.domain_prepared(xid, now),
            (_, Phase::Prepare) => self.decide(xid, now),
        }
    }

    /// Prepare round of an owner commit is over: log the decision and send
    /// phase two to the participants that voted to commit
    fn decide(&mut self, xid: Xid, now: Instant) -> Result<()> {
        let Some(correlation) = self.correlations.get(&xid) else {
            return Ok(());
        };
        let aggregate = correlation.aggregate();
        let voted_ok = correlation.answered(Outcome::Ok);
        let read_only = correlation.answered(Outcome::ReadOnly);
        let reply = correlation.reply.clone();

        for resource in &read_only {
            self.advance(&xid, *resource, Stage::NotInvolved, Outcome::ReadOnly);
        }

        if voted_ok.is_empty() {
            // Nobody holds prepared work, there is nothing to decide
            self.settle(&xid, Stage::PrepareReplied);
            return self.finish(xid, now);
        }

        let (decision, phase) = if aggregate.is_success() {
            (Decision::Commit, Phase::Commit)
        } else {
            (Decision::Rollback, Phase::Rollback)
        };

        self.log_decision(xid, decision, aggregate, &voted_ok, reply.as_ref())?;
        let deadline = self.deadline(now);
        self.correlations.next_round(&xid, phase, &voted_ok, deadline)?;
        self.fan_out(xid, phase, &voted_ok, Flags::NO_FLAGS, now, true)?;
        self.settle(&xid, Stage::PrepareReplied);
        Ok(())
    }

    /// Prepare on behalf of another domain is over: report the vote and keep
    /// the prepared participants for phase two
    fn domain_prepared(&mut self, xid: Xid, now: Instant) -> Result<()> {
        let Some(correlation) = self.correlations.get(&xid) else {
            return Ok(());
        };
        let voted_ok = correlation.answered(Outcome::Ok);
        let read_only = correlation.answered(Outcome::ReadOnly);

        let Some(closed) = self.correlations.close(&xid) else {
            return Ok(());
        };

        for resource in &read_only {
            self.advance(&xid, *resource, Stage::NotInvolved, Outcome::ReadOnly);
        }
        for resource in self.in_stage(&xid, Stage::PrepareReplied) {
            if !voted_ok.contains(&resource) {
                self.advance(&xid, resource, Stage::Done, Outcome::ReadOnly);
            }
        }

        tracing::info!("[{}] prepared with {}", xid, closed.outcome);
        if let Some(reply) = &closed.reply {
            self.reply(reply, xid, closed.outcome, now)?;
        }

        if self.transactions.get(&xid).is_some_and(|t| t.is_terminal()) {
            self.retire(&xid);
        }
        Ok(())
    }

    /// Commit or rollback round is over: reply and forget the transaction
    fn finish(&mut self, xid: Xid, now: Instant) -> Result<()> {
        let Some(closed) = self.correlations.close(&xid) else {
            return Ok(());
        };

        self.settle(&xid, Stage::CommitReplied);
        self.settle(&xid, Stage::RollbackReplied);

        tracing::info!(
            "[{}] {} finished with {}",
            xid,
            closed.phase.as_str(),
            closed.outcome
        );

        // A branch that is unknown or had nothing to do is rolled back
        let outcome = match (closed.phase, closed.outcome) {
            (Phase::Rollback, Outcome::NotFound | Outcome::ReadOnly) => Outcome::Ok,
            (_, outcome) => outcome,
        };

        if closed.logged {
            self.journal.append(JournalEntry::Completed(xid))?;
        }
        if let Some(reply) = &closed.reply {
            let request = reply_request(reply, xid, outcome)?;
            if closed.logged {
                self.requests.defer_until_flush(request);
            } else {
                self.send(request, now)?;
            }
        }

        self.retire(&xid);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn start_round(
        &mut self,
        xid: Xid,
        reply: ReplyTo,
        origin: Origin,
        phase: Phase,
        resources: &[ResourceId],
        flags: Flags,
        now: Instant,
    ) -> Result<()> {
        let deadline = self.deadline(now);
        self.correlations
            .open(xid, Some(reply), origin, phase, resources, deadline)?;
        self.fan_out(xid, phase, resources, flags, now, false)
    }

    /// Build one request per participant and send them, or hold them until
    /// the log is flushed when `persistent`
    pub(crate) fn fan_out(
        &mut self,
        xid: Xid,
        phase: Phase,
        resources: &[ResourceId],
        flags: Flags,
        now: Instant,
        persistent: bool,
    ) -> Result<()> {
        let mut requests = Vec::with_capacity(resources.len());
        for resource in resources {
            self.advance(&xid, *resource, requested(phase), Outcome::ReadOnly);
            let message = ResourceRequest {
                phase,
                process: self.identity,
                xid,
                resource: *resource,
                flags,
            }
            .into_message()?;
            requests.push(Request::resource(*resource, xid, message));
        }

        for request in requests {
            if persistent {
                self.requests.defer_until_flush(request);
            } else {
                self.send(request, now)?;
            }
        }
        Ok(())
    }

    /// The participant will not answer: count it as a resource error
    fn fail(&mut self, xid: Xid, resource: ResourceId, now: Instant) -> Result<()> {
        if !self.awaits(&xid, resource) {
            return Ok(());
        }

        tracing::error!("[{}] {} failed", xid, resource);
        self.advance(&xid, resource, Stage::Error, Outcome::ResourceError);
        self.requests.cancel(&xid, resource);

        match self.correlations.fail_participant(&xid, resource) {
            Progress::Complete => self.complete(xid, now),
            Progress::Waiting | Progress::Ignored => Ok(()),
        }
    }

    // === HELPERS ===

    pub(crate) fn log_decision(
        &mut self,
        xid: Xid,
        decision: Decision,
        outcome: Outcome,
        participants: &[ResourceId],
        reply: Option<&ReplyTo>,
    ) -> Result<()> {
        let caller = reply.map(|reply| Caller {
            process: reply.process,
            correlation: reply.correlation,
            resource: reply.resource,
            requested: match reply.kind {
                RequestKind::Rollback => Decision::Rollback,
                _ => Decision::Commit,
            },
        });

        tracing::info!("[{}] decided {:?} ({})", xid, decision, outcome);
        self.journal.append(JournalEntry::Decision(DecisionRecord {
            xid,
            decision,
            outcome,
            participants: participants.to_vec(),
            caller,
        }))?;
        self.correlations.set_logged(&xid);
        Ok(())
    }

    pub(crate) fn send(&mut self, request: Request, now: Instant) -> Result<()> {
        let mut router = Dispatch {
            resources: &mut self.resources,
            now,
        };
        match self
            .requests
            .try_send_or_defer(self.transport.as_ref(), &mut router, request)
        {
            Delivery::Sent | Delivery::Deferred => Ok(()),
            Delivery::Failed(request) => self.undeliverable(request, now),
        }
    }

    fn reply(&mut self, reply: &ReplyTo, xid: Xid, outcome: Outcome, now: Instant) -> Result<()> {
        let request = reply_request(reply, xid, outcome)?;
        self.send(request, now)
    }

    fn undeliverable(&mut self, request: Request, now: Instant) -> Result<()> {
        match request.target {
            Target::Resource { resource, xid } => {
                tracing::error!("[{}] {} cannot be reached", xid, resource);
                self.fail(xid, resource, now)
            }
            Target::Reply(queue) => {
                tracing::error!("reply to {} could not be delivered", queue);
                Ok(())
            }
        }
    }

    /// A request from another domain may name our branch by its global id
    fn resolve(&self, xid: &Xid) -> Xid {
        if self.transactions.contains(xid) {
            return *xid;
        }
        self.transactions.find_global(xid).unwrap_or(*xid)
    }

    fn stage_of(&self, xid: &Xid) -> Stage {
        self.transactions
            .get(xid)
            .map_or(Stage::NotInvolved, |t| t.stage())
    }

    fn in_stage(&self, xid: &Xid, stage: Stage) -> Vec<ResourceId> {
        self.transactions
            .get(xid)
            .map(|t| t.in_stage(stage))
            .unwrap_or_default()
    }

    /// `resource` owes an answer to the open correlation for `xid`
    fn awaits(&self, xid: &Xid, resource: ResourceId) -> bool {
        self.correlations.get(xid).is_some_and(|c| {
            c.participants()
                .iter()
                .any(|p| p.resource == resource && p.state == ParticipantState::Pending)
        })
    }

    pub(crate) fn deadline(&self, now: Instant) -> Option<Instant> {
        self.config.reply_timeout.map(|timeout| now + timeout)
    }

    /// Move a resource forward, logging when the registry refuses
    pub(crate) fn advance(&mut self, xid: &Xid, resource: ResourceId, stage: Stage, outcome: Outcome) {
        if let Err(err) = self.transactions.advance(xid, resource, stage, outcome) {
            // Invalid transitions are reported by the registry itself
            if !matches!(err, CoordinatorError::InvalidTransition { .. }) {
                tracing::error!("[{}] {}", xid, err);
            }
        }
    }

    /// Every resource of `xid` that is in `stage` is done
    fn settle(&mut self, xid: &Xid, stage: Stage) {
        for resource in self.in_stage(xid, stage) {
            self.advance(xid, resource, Stage::Done, Outcome::ReadOnly);
        }
    }

    pub(crate) fn retire(&mut self, xid: &Xid) {
        if let Err(err) = self.transactions.retire(xid) {
            tracing::error!("[{}] {}", xid, err);
            self.transactions.remove(xid);
        }
    }
}
