//! Process, queue and resource handles

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating system process id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbound queue of a process, as known to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue-{}", self.0)
    }
}

/// Address of a process: who it is and where to reach it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: Pid,
    pub queue: QueueId,
}

impl ProcessHandle {
    pub fn new(pid: Pid, queue: QueueId) -> Self {
        Self { pid, queue }
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.queue)
    }
}

/// Identity of a resource taking part in transactions.
///
/// Positive ids name configured resource proxies. Negative ids name external
/// resources (queue groups, gateways to other domains) that announce
/// themselves at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub i64);

impl ResourceId {
    pub fn is_external(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_external() {
            write!(f, "external-{}", -self.0)
        } else {
            write!(f, "rm-{}", self.0)
        }
    }
}
