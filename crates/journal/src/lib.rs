//! Decision log trait and types for the transaction manager
//!
//! The log holds one record per decided transaction that has not yet been
//! confirmed complete. Appends are buffered until [`Journal::flush`], which
//! makes everything appended so far durable at once.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tmx_common::{Outcome, ProcessHandle, ResourceId, Xid};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to encode entry: {0}")]
    Encoding(String),

    #[error("Corrupt journal record: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// Outcome decided for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Rollback,
}

/// Who asked for the decision and is owed a reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub process: ProcessHandle,
    pub correlation: Uuid,
    pub resource: ResourceId,
    /// What the caller asked for; a requested commit can end in a rollback
    pub requested: Decision,
}

/// A durable decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub xid: Xid,
    pub decision: Decision,
    /// Aggregate outcome known when the decision was taken
    pub outcome: Outcome,
    /// Participants that still have to be told, in registration order
    pub participants: Vec<ResourceId>,
    pub caller: Option<Caller>,
}

impl DecisionRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| JournalError::Encoding(e.to_string()))?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| JournalError::Corrupt(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    Decision(DecisionRecord),
    /// Every participant has acknowledged the decision for this xid
    Completed(Xid),
}

impl JournalEntry {
    pub fn xid(&self) -> &Xid {
        match self {
            JournalEntry::Decision(record) => &record.xid,
            JournalEntry::Completed(xid) => xid,
        }
    }
}

/// Durable log of transaction decisions
pub trait Journal: Send {
    /// Buffer an entry; it is not durable until the next flush
    fn append(&mut self, entry: JournalEntry) -> Result<()>;

    /// Number of entries appended since the last flush
    fn unflushed(&self) -> usize;

    /// Make every buffered entry durable
    fn flush(&mut self) -> Result<()>;

    /// Durable decisions without a completion, ordered by xid
    fn outstanding(&self) -> Result<Vec<DecisionRecord>>;
}

impl<J: Journal + ?Sized> Journal for Box<J> {
    fn append(&mut self, entry: JournalEntry) -> Result<()> {
        (**self).append(entry)
    }

    fn unflushed(&self) -> usize {
        (**self).unflushed()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn outstanding(&self) -> Result<Vec<DecisionRecord>> {
        (**self).outstanding()
    }
}

/// Replay a sequence of entries into the decisions still outstanding.
///
/// A later decision for the same xid replaces an earlier one; a completion
/// removes it.
pub fn replay<'a, I>(entries: I) -> Vec<DecisionRecord>
where
    I: IntoIterator<Item = &'a JournalEntry>,
{
    let mut outstanding = BTreeMap::new();
    for entry in entries {
        match entry {
            JournalEntry::Decision(record) => {
                outstanding.insert(record.xid, record.clone());
            }
            JournalEntry::Completed(xid) => {
                outstanding.remove(xid);
            }
        }
    }
    outstanding.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmx_common::{Pid, QueueId};

    fn record(xid: Xid, decision: Decision) -> DecisionRecord {
        DecisionRecord {
            xid,
            decision,
            outcome: Outcome::Ok,
            participants: vec![ResourceId(1), ResourceId(2)],
            caller: Some(Caller {
                process: ProcessHandle::new(Pid(7), QueueId(7)),
                correlation: Uuid::now_v7(),
                resource: ResourceId(1),
                requested: Decision::Commit,
            }),
        }
    }

    #[test]
    fn test_replay_drops_completed() {
        let a = Xid::new();
        let b = Xid::new();
        let entries = vec![
            JournalEntry::Decision(record(a, Decision::Commit)),
            JournalEntry::Decision(record(b, Decision::Rollback)),
            JournalEntry::Completed(a),
        ];

        let outstanding = replay(&entries);
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].xid, b);
        assert_eq!(outstanding[0].decision, Decision::Rollback);
    }

    #[test]
    fn test_replay_keeps_latest_decision() {
        let xid = Xid::new();
        let mut later = record(xid, Decision::Rollback);
        later.outcome = Outcome::RollbackOther;
        let entries = vec![
            JournalEntry::Decision(record(xid, Decision::Commit)),
            JournalEntry::Decision(later.clone()),
        ];
        assert_eq!(replay(&entries), vec![later]);
    }

    #[test]
    fn test_record_bytes() {
        let original = record(Xid::new().branch(), Decision::Commit);
        let decoded = DecisionRecord::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, original);

        assert!(matches!(
            DecisionRecord::from_bytes(&[0xff]),
            Err(JournalError::Corrupt(_))
        ));
    }
}
