//! Messages produced by the transaction manager

use crate::messages::Phase;
use crate::{Result, decode, encode, expect_type};
use serde::{Deserialize, Serialize};
use tmx_common::{Flags, Outcome, ProcessHandle, ResourceId, Xid};
use tmx_transport::Message;
use uuid::Uuid;

/// Prepare, commit or rollback request sent to one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub phase: Phase,
    /// The transaction manager, where the participant replies
    pub process: ProcessHandle,
    pub xid: Xid,
    pub resource: ResourceId,
    pub flags: Flags,
}

impl ResourceRequest {
    pub const TYPE: &'static str = "resource_request";

    pub fn into_message(&self) -> Result<Message> {
        encode(Self::TYPE, self)
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        expect_type(message, Self::TYPE)?;
        decode(message)
    }
}

/// What a [`TransactionReply`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Prepare,
    Commit,
    Rollback,
    Involved,
}

impl From<Phase> for RequestKind {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Prepare => RequestKind::Prepare,
            Phase::Commit => RequestKind::Commit,
            Phase::Rollback => RequestKind::Rollback,
        }
    }
}

/// The single reply to a transaction request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReply {
    pub kind: RequestKind,
    pub correlation: Uuid,
    pub xid: Xid,
    pub resource: ResourceId,
    pub outcome: Outcome,
}

impl TransactionReply {
    pub const TYPE: &'static str = "transaction_reply";

    pub fn into_message(&self) -> Result<Message> {
        encode(Self::TYPE, self)
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        expect_type(message, Self::TYPE)?;
        decode(message)
    }
}
