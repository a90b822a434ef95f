//! Correlation tracker
//!
//! Fan-out/fan-in bookkeeping: one correlation per xid while a request is
//! being served, recording which participants have answered and folding
//! their outcomes into one verdict. A correlation spans every round of a
//! decision (prepare, then commit or rollback) so a second request for the
//! same xid can never slip in between rounds.

use crate::error::{CoordinatorError, Result};
use std::collections::HashMap;
use std::time::Instant;
use tmx_common::{Outcome, ProcessHandle, ResourceId, Xid};
use tmx_protocol::{Phase, RequestKind};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Pending,
    Replied,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub resource: ResourceId,
    pub state: ParticipantState,
    pub outcome: Option<Outcome>,
    deadline: Option<Instant>,
}

/// Where the single reply goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTo {
    pub process: ProcessHandle,
    pub correlation: Uuid,
    pub resource: ResourceId,
    pub kind: RequestKind,
}

/// Who started the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The transaction's owner asked for commit or rollback
    Owner,
    /// The transaction manager of another domain drives us as a resource
    Domain,
    /// Re-driven from the log after a restart
    Recovery,
}

#[derive(Debug, Clone)]
pub struct Correlation {
    pub xid: Xid,
    pub reply: Option<ReplyTo>,
    pub origin: Origin,
    /// Round in progress
    pub phase: Phase,
    /// A decision for this xid is in the log
    pub logged: bool,
    /// Aggregate of earlier rounds
    floor: Outcome,
    participants: Vec<Participant>,
}

impl Correlation {
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn is_complete(&self) -> bool {
        self.participants
            .iter()
            .all(|p| p.state != ParticipantState::Pending)
    }

    /// Outcome of the current round alone
    pub fn round_outcome(&self) -> Outcome {
        Outcome::fold(self.participants.iter().filter_map(|p| p.outcome))
    }

    /// Outcome across all rounds so far
    pub fn aggregate(&self) -> Outcome {
        self.floor.severest(self.round_outcome())
    }

    /// Participants of the current round that answered with `outcome`
    pub fn answered(&self, outcome: Outcome) -> Vec<ResourceId> {
        self.participants
            .iter()
            .filter(|p| p.outcome == Some(outcome))
            .map(|p| p.resource)
            .collect()
    }

    fn participant(&mut self, resource: ResourceId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.resource == resource)
    }
}

/// Result of feeding an answer into a correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Waiting,
    Complete,
    /// No open correlation expects an answer from this participant
    Ignored,
}

/// A finished correlation, handed out exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed {
    pub xid: Xid,
    pub reply: Option<ReplyTo>,
    pub origin: Origin,
    pub phase: Phase,
    pub outcome: Outcome,
    pub logged: bool,
}

#[derive(Default)]
pub struct CorrelationTracker {
    correlations: HashMap<Xid, Correlation>,
}

fn participants(resources: &[ResourceId], deadline: Option<Instant>) -> Vec<Participant> {
    let mut participants: Vec<Participant> = Vec::with_capacity(resources.len());
    for resource in resources {
        if participants.iter().all(|p| p.resource != *resource) {
            participants.push(Participant {
                resource: *resource,
                state: ParticipantState::Pending,
                outcome: None,
                deadline,
            });
        }
    }
    participants
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a correlation over `resources`. Fails if one is already open
    /// for the xid.
    pub fn open(
        &mut self,
        xid: Xid,
        reply: Option<ReplyTo>,
        origin: Origin,
        phase: Phase,
        resources: &[ResourceId],
        deadline: Option<Instant>,
    ) -> Result<()> {
        if self.correlations.contains_key(&xid) {
            return Err(CoordinatorError::DuplicateCorrelation(xid));
        }

        tracing::debug!(
            "[{}] correlating {} over {} participants",
            xid,
            phase.as_str(),
            resources.len()
        );

        self.correlations.insert(
            xid,
            Correlation {
                xid,
                reply,
                origin,
                phase,
                logged: false,
                floor: Outcome::ReadOnly,
                participants: participants(resources, deadline),
            },
        );
        Ok(())
    }

    /// Re-open a logged decision after a restart. `floor` is the outcome
    /// that was known when the decision was taken.
    pub fn resume(
        &mut self,
        xid: Xid,
        reply: Option<ReplyTo>,
        phase: Phase,
        resources: &[ResourceId],
        floor: Outcome,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if self.correlations.contains_key(&xid) {
            return Err(CoordinatorError::DuplicateCorrelation(xid));
        }

        self.correlations.insert(
            xid,
            Correlation {
                xid,
                reply,
                origin: Origin::Recovery,
                phase,
                logged: true,
                floor,
                participants: participants(resources, deadline),
            },
        );
        Ok(())
    }

    /// Begin the next round of an open correlation. The outcome so far is
    /// kept as a floor for the final verdict.
    pub fn next_round(
        &mut self,
        xid: &Xid,
        phase: Phase,
        resources: &[ResourceId],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let correlation = self
            .correlations
            .get_mut(xid)
            .ok_or(CoordinatorError::TransactionNotFound(*xid))?;

        correlation.floor = correlation.aggregate();
        correlation.phase = phase;
        correlation.participants = participants(resources, deadline);
        Ok(())
    }

    pub fn get(&self, xid: &Xid) -> Option<&Correlation> {
        self.correlations.get(xid)
    }

    pub fn contains(&self, xid: &Xid) -> bool {
        self.correlations.contains_key(xid)
    }

    pub fn len(&self) -> usize {
        self.correlations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correlations.is_empty()
    }

    pub fn set_logged(&mut self, xid: &Xid) {
        if let Some(correlation) = self.correlations.get_mut(xid) {
            correlation.logged = true;
        }
    }

    /// Record a participant's answer
    pub fn record_reply(&mut self, xid: &Xid, resource: ResourceId, outcome: Outcome) -> Progress {
        let state = match outcome {
            Outcome::ResourceFail | Outcome::ResourceError => ParticipantState::Error,
            _ => ParticipantState::Replied,
        };
        self.settle(xid, resource, state, outcome)
    }

    /// The participant will never answer: its process died, it timed out or
    /// it could not be reached. Counts as a resource error.
    pub fn fail_participant(&mut self, xid: &Xid, resource: ResourceId) -> Progress {
        self.settle(xid, resource, ParticipantState::Error, Outcome::ResourceError)
    }

    fn settle(
        &mut self,
        xid: &Xid,
        resource: ResourceId,
        state: ParticipantState,
        outcome: Outcome,
    ) -> Progress {
        let Some(correlation) = self.correlations.get_mut(xid) else {
            return Progress::Ignored;
        };
        let Some(participant) = correlation.participant(resource) else {
            tracing::warn!("[{}] {} is not a participant, ignoring", xid, resource);
            return Progress::Ignored;
        };
        if participant.state != ParticipantState::Pending {
            tracing::warn!(
                "[{}] {} already answered ({:?}), ignoring {}",
                xid,
                resource,
                participant.state,
                outcome
            );
            return Progress::Ignored;
        }

        participant.state = state;
        participant.outcome = Some(outcome);
        participant.deadline = None;

        if correlation.is_complete() {
            Progress::Complete
        } else {
            Progress::Waiting
        }
    }

    /// Correlations still waiting on `resource`
    pub fn pending_on(&self, resource: ResourceId) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self
            .correlations
            .values()
            .filter(|c| {
                c.participants
                    .iter()
                    .any(|p| p.resource == resource && p.state == ParticipantState::Pending)
            })
            .map(|c| c.xid)
            .collect();
        xids.sort();
        xids
    }

    /// Pending participants whose deadline has passed
    pub fn expired(&self, now: Instant) -> Vec<(Xid, ResourceId)> {
        let mut expired: Vec<(Xid, ResourceId)> = self
            .correlations
            .values()
            .flat_map(|c| {
                c.participants
                    .iter()
                    .filter(move |p| {
                        p.state == ParticipantState::Pending
                            && p.deadline.is_some_and(|deadline| deadline <= now)
                    })
                    .map(move |p| (c.xid, p.resource))
            })
            .collect();
        expired.sort();
        expired
    }

    /// Earliest deadline of any pending participant
    pub fn next_deadline(&self) -> Option<Instant> {
        self.correlations
            .values()
            .flat_map(|c| c.participants.iter())
            .filter(|p| p.state == ParticipantState::Pending)
            .filter_map(|p| p.deadline)
            .min()
    }

    /// Remove a correlation and hand out what is needed for the reply
    pub fn close(&mut self, xid: &Xid) -> Option<Closed> {
        let correlation = self.correlations.remove(xid)?;
        let outcome = correlation.aggregate();
        Some(Closed {
            xid: correlation.xid,
            reply: correlation.reply,
            origin: correlation.origin,
            phase: correlation.phase,
            outcome,
            logged: correlation.logged,
        })
    }
}
