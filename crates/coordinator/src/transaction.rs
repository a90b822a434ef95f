//! Transaction registry
//!
//! Every in-flight transaction with the resources taking part in it and how
//! far each resource has come through two-phase commit. A transaction is only
//! as far along as its least advanced resource.

use crate::error::{CoordinatorError, Result};
use std::collections::HashMap;
use tmx_common::{Outcome, ProcessHandle, ResourceId, Xid};

/// Two-phase commit stage of one resource.
///
/// Declaration order is the order used to compute a transaction's stage; it
/// is not the transition table, see [`Stage::can_advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Involved,
    PrepareRequested,
    PrepareReplied,
    CommitRequested,
    CommitReplied,
    RollbackRequested,
    RollbackReplied,
    Done,
    Error,
    NotInvolved,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Error | Stage::NotInvolved)
    }

    /// Forward transitions. Staying put is allowed and does nothing.
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (from, Error) => !from.is_terminal(),
            (Involved, PrepareRequested | CommitRequested | RollbackRequested) => true,
            (PrepareRequested, PrepareReplied) => true,
            (PrepareReplied, CommitRequested | RollbackRequested | Done | NotInvolved) => true,
            (CommitRequested, CommitReplied) => true,
            (RollbackRequested, RollbackReplied) => true,
            (CommitReplied | RollbackReplied, Done) => true,
            _ => false,
        }
    }
}

/// One resource taking part in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub id: ResourceId,
    pub stage: Stage,
    /// Most severe outcome reported so far
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub xid: Xid,
    /// Process that started the transaction
    pub owner: ProcessHandle,
    /// In registration order
    resources: Vec<ResourceEntry>,
}

impl Transaction {
    fn new(xid: Xid, owner: ProcessHandle) -> Self {
        Self {
            xid,
            owner,
            resources: Vec::new(),
        }
    }

    pub fn resources(&self) -> &[ResourceEntry] {
        &self.resources
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ResourceEntry> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Ids of resources currently in `stage`, in registration order
    pub fn in_stage(&self, stage: Stage) -> Vec<ResourceId> {
        self.resources
            .iter()
            .filter(|r| r.stage == stage)
            .map(|r| r.id)
            .collect()
    }

    /// Least advanced stage among the resources, `NotInvolved` if there are none
    pub fn stage(&self) -> Stage {
        self.resources
            .iter()
            .map(|r| r.stage)
            .min()
            .unwrap_or(Stage::NotInvolved)
    }

    /// Most severe outcome among the resources
    pub fn outcome(&self) -> Outcome {
        Outcome::fold(self.resources.iter().map(|r| r.outcome))
    }

    pub fn is_terminal(&self) -> bool {
        self.resources.iter().all(|r| r.stage.is_terminal())
    }
}

/// Result of resolving the participants of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<ResourceId>),
    /// Known transaction that never touched a resource
    Empty,
    Unknown,
}

#[derive(Default)]
pub struct TransactionRegistry {
    transactions: HashMap<Xid, Transaction>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction if it is not known yet
    pub fn begin(&mut self, xid: Xid, owner: ProcessHandle) -> &mut Transaction {
        self.transactions.entry(xid).or_insert_with(|| {
            tracing::debug!("[{}] begin, owner {}", xid, owner);
            Transaction::new(xid, owner)
        })
    }

    /// Add `resource` to the transaction in stage `Involved`. Returns false
    /// if it was already there.
    pub fn mark_involved(&mut self, xid: Xid, resource: ResourceId, owner: ProcessHandle) -> bool {
        let transaction = self.begin(xid, owner);
        if transaction.resource(resource).is_some() {
            return false;
        }

        transaction.resources.push(ResourceEntry {
            id: resource,
            stage: Stage::Involved,
            outcome: Outcome::ReadOnly,
        });
        tracing::debug!("[{}] {} involved", xid, resource);
        true
    }

    /// Rebuild a transaction from the log, every resource in `stage`
    pub fn restore(
        &mut self,
        xid: Xid,
        owner: ProcessHandle,
        resources: &[ResourceId],
        stage: Stage,
        outcome: Outcome,
    ) -> &Transaction {
        let transaction = self.begin(xid, owner);
        for id in resources {
            if transaction.resource(*id).is_none() {
                transaction.resources.push(ResourceEntry {
                    id: *id,
                    stage,
                    outcome,
                });
            }
        }
        transaction
    }

    pub fn resources_for(&self, xid: &Xid) -> Lookup {
        match self.transactions.get(xid) {
            None => Lookup::Unknown,
            Some(transaction) if transaction.resources.is_empty() => Lookup::Empty,
            Some(transaction) => {
                Lookup::Found(transaction.resources.iter().map(|r| r.id).collect())
            }
        }
    }

    pub fn get(&self, xid: &Xid) -> Option<&Transaction> {
        self.transactions.get(xid)
    }

    pub fn contains(&self, xid: &Xid) -> bool {
        self.transactions.contains_key(xid)
    }

    /// The only registered transaction belonging to the same global
    /// transaction as `xid`, if there is exactly one
    pub fn find_global(&self, xid: &Xid) -> Option<Xid> {
        let mut matches = self
            .transactions
            .keys()
            .filter(|candidate| candidate.same_global(xid));
        match (matches.next(), matches.next()) {
            (Some(found), None) => Some(*found),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Move a resource forward. Backward or sideways moves are rejected and
    /// logged as an invariant violation.
    pub fn advance(
        &mut self,
        xid: &Xid,
        resource: ResourceId,
        stage: Stage,
        outcome: Outcome,
    ) -> Result<()> {
        let transaction = self
            .transactions
            .get_mut(xid)
            .ok_or(CoordinatorError::TransactionNotFound(*xid))?;
        let entry = transaction
            .resources
            .iter_mut()
            .find(|r| r.id == resource)
            .ok_or(CoordinatorError::NotParticipant {
                xid: *xid,
                resource,
            })?;

        if entry.stage == stage {
            return Ok(());
        }

        if !entry.stage.can_advance_to(stage) {
            tracing::error!(
                "[{}] invalid transition for {}: {:?} -> {:?}",
                xid,
                resource,
                entry.stage,
                stage
            );
            return Err(CoordinatorError::InvalidTransition {
                xid: *xid,
                resource,
                from: entry.stage,
                to: stage,
            });
        }

        entry.stage = stage;
        entry.outcome = entry.outcome.severest(outcome);
        Ok(())
    }

    /// Remove a transaction whose resources have all reached a terminal stage
    pub fn retire(&mut self, xid: &Xid) -> Result<Transaction> {
        let transaction = self
            .transactions
            .get(xid)
            .ok_or(CoordinatorError::TransactionNotFound(*xid))?;
        if !transaction.is_terminal() {
            return Err(CoordinatorError::NotTerminal(*xid));
        }
        tracing::debug!("[{}] retired with {}", xid, transaction.outcome());
        self.transactions
            .remove(xid)
            .ok_or(CoordinatorError::TransactionNotFound(*xid))
    }

    /// Remove a transaction regardless of resource stages
    pub fn remove(&mut self, xid: &Xid) -> Option<Transaction> {
        self.transactions.remove(xid)
    }
}
