//! Messages consumed by the transaction manager

use crate::{ProtocolError, Result, decode, encode, message_type};
use serde::{Deserialize, Serialize};
use tmx_common::{Flags, Pid, ProcessHandle, ResourceId, Xid};
use tmx_transport::Message;
use uuid::Uuid;

/// Two-phase commit phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Prepare,
    Commit,
    Rollback,
}

impl Phase {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepare" => Some(Self::Prepare),
            "commit" => Some(Self::Commit),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

/// Commit, rollback or prepare of a whole transaction, sent by the
/// transaction's owner or by the transaction manager of a peer domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Where the reply goes
    pub process: ProcessHandle,
    /// Echoed in the reply
    pub correlation: Uuid,
    pub xid: Xid,
    /// Resource the caller acts for, echoed in the reply. Zero when the
    /// transaction's owner asks; a peer domain names the resource this
    /// domain is to it.
    pub resource: ResourceId,
    /// XA flags passed on to the participants
    pub flags: Flags,
}

impl TransactionRequest {
    /// Sent by the transaction manager of a peer domain
    pub fn from_domain(&self) -> bool {
        self.resource != ResourceId(0)
    }
}

/// Announces that resources take part in a transaction.
///
/// An empty `resources` list means the sending process itself is the
/// participant (a queue group or a gateway to another domain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvolvedRequest {
    pub process: ProcessHandle,
    pub xid: Xid,
    pub resources: Vec<ResourceId>,
    /// Set when the sender wants an acknowledgement
    pub correlation: Option<Uuid>,
}

/// Reply from a participant to a prepare, commit or rollback request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReply {
    pub process: ProcessHandle,
    pub resource: ResourceId,
    pub xid: Xid,
    pub phase: Phase,
    /// XA return code
    pub code: i32,
}

/// A resource proxy instance has opened its resource and is ready for work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReady {
    pub process: ProcessHandle,
    pub resource: ResourceId,
    /// XA return code of the open call
    pub code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Exited(i32),
    Signaled(i32),
    Core,
}

/// A process has terminated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub pid: Pid,
    pub reason: ExitReason,
}

/// Everything the transaction manager consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Commit(TransactionRequest),
    Rollback(TransactionRequest),
    Prepare(TransactionRequest),
    Involved(InvolvedRequest),
    ResourceReply(ResourceReply),
    ResourceReady(ResourceReady),
    ProcessExit(ProcessExit),
    Shutdown,
}

impl Inbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Commit(_) => "commit",
            Inbound::Rollback(_) => "rollback",
            Inbound::Prepare(_) => "prepare",
            Inbound::Involved(_) => "involved",
            Inbound::ResourceReply(_) => "resource_reply",
            Inbound::ResourceReady(_) => "resource_ready",
            Inbound::ProcessExit(_) => "process_exit",
            Inbound::Shutdown => "shutdown",
        }
    }

    pub fn into_message(self) -> Result<Message> {
        let kind = self.kind();
        match &self {
            Inbound::Commit(request) | Inbound::Rollback(request) | Inbound::Prepare(request) => {
                encode(kind, request)
            }
            Inbound::Involved(request) => encode(kind, request),
            Inbound::ResourceReply(reply) => encode(kind, reply),
            Inbound::ResourceReady(ready) => encode(kind, ready),
            Inbound::ProcessExit(exit) => encode(kind, exit),
            Inbound::Shutdown => encode(kind, &()),
        }
    }

    /// Parse a raw message into a typed inbound message
    pub fn from_message(message: &Message) -> Result<Self> {
        let inbound = match message_type(message)? {
            "commit" => Inbound::Commit(decode(message)?),
            "rollback" => Inbound::Rollback(decode(message)?),
            "prepare" => Inbound::Prepare(decode(message)?),
            "involved" => Inbound::Involved(decode(message)?),
            "resource_reply" => Inbound::ResourceReply(decode(message)?),
            "resource_ready" => Inbound::ResourceReady(decode(message)?),
            "process_exit" => Inbound::ProcessExit(decode(message)?),
            "shutdown" => Inbound::Shutdown,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(inbound)
    }
}
