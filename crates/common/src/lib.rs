//! Common types for the transaction manager
//!
//! This crate defines:
//! - Global transaction identifiers (UUIDv7-based, optionally branch qualified)
//! - Process, queue and resource handles
//! - XA flags
//! - The outcome vocabulary and its severity ranking

mod flags;
mod handle;
mod outcome;
mod xid;

pub use flags::Flags;
pub use handle::{Pid, ProcessHandle, QueueId, ResourceId};
pub use outcome::Outcome;
pub use xid::{Xid, XidError};
