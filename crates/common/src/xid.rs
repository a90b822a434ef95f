//! Global transaction identifier
//!
//! An xid is a format id, a global transaction id and an optional branch
//! qualifier. Both ids are UUIDv7 so identifiers created on one node sort by
//! creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced when decoding an xid
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XidError {
    #[error("Invalid xid: {0}")]
    Invalid(String),

    #[error("Invalid xid encoding: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Global transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format: i64,
    global: Uuid,
    branch: Option<Uuid>,
}

impl Xid {
    /// Format id stamped on xids created by this transaction manager
    pub const FORMAT: i64 = 0x746d78;

    /// Encoded length, see [`Xid::to_bytes`]
    pub const ENCODED_LEN: usize = 8 + 16 + 1 + 16;

    /// Create a new top level xid
    pub fn new() -> Self {
        Self {
            format: Self::FORMAT,
            global: Uuid::now_v7(),
            branch: None,
        }
    }

    pub fn from_parts(format: i64, global: Uuid, branch: Option<Uuid>) -> Self {
        Self {
            format,
            global,
            branch,
        }
    }

    /// Create a new branch of the same global transaction
    pub fn branch(&self) -> Self {
        Self {
            format: self.format,
            global: self.global,
            branch: Some(Uuid::now_v7()),
        }
    }

    pub fn format(&self) -> i64 {
        self.format
    }

    pub fn global(&self) -> &Uuid {
        &self.global
    }

    pub fn branch_qualifier(&self) -> Option<&Uuid> {
        self.branch.as_ref()
    }

    /// True if both xids belong to the same global transaction, ignoring
    /// branch qualifiers
    pub fn same_global(&self, other: &Xid) -> bool {
        self.format == other.format && self.global == other.global
    }

    /// Fixed size encoding, used as a storage key.
    ///
    /// Layout: format (8 bytes, big-endian), global id (16 bytes), a branch
    /// marker byte and the branch id (16 bytes, zero when absent). Byte order
    /// matches [`Ord`].
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[..8].copy_from_slice(&self.format.to_be_bytes());
        bytes[8..24].copy_from_slice(self.global.as_bytes());
        if let Some(branch) = &self.branch {
            bytes[24] = 1;
            bytes[25..].copy_from_slice(branch.as_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, XidError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(XidError::Length {
                expected: Self::ENCODED_LEN,
                actual: bytes.len(),
            });
        }

        let mut format = [0u8; 8];
        format.copy_from_slice(&bytes[..8]);
        let mut global = [0u8; 16];
        global.copy_from_slice(&bytes[8..24]);

        let branch = match bytes[24] {
            0 => None,
            1 => {
                let mut branch = [0u8; 16];
                branch.copy_from_slice(&bytes[25..]);
                Some(Uuid::from_bytes(branch))
            }
            marker => return Err(XidError::Invalid(format!("branch marker {marker}"))),
        };

        Ok(Self {
            format: i64::from_be_bytes(format),
            global: Uuid::from_bytes(global),
            branch,
        })
    }

    /// Parse the `format:global[:branch]` representation produced by `Display`
    pub fn parse(s: &str) -> Result<Self, XidError> {
        let mut parts = s.split(':');
        let format = parts
            .next()
            .and_then(|part| u64::from_str_radix(part, 16).ok())
            .map(|format| format as i64)
            .ok_or_else(|| XidError::Invalid(s.to_string()))?;
        let global = parts
            .next()
            .and_then(|part| Uuid::parse_str(part).ok())
            .ok_or_else(|| XidError::Invalid(s.to_string()))?;
        let branch = match parts.next() {
            Some(part) => {
                Some(Uuid::parse_str(part).map_err(|_| XidError::Invalid(s.to_string()))?)
            }
            None => None,
        };
        if parts.next().is_some() {
            return Err(XidError::Invalid(s.to_string()));
        }

        Ok(Self {
            format,
            global,
            branch,
        })
    }
}

impl Default for Xid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}", self.format, self.global)?;
        if let Some(branch) = &self.branch {
            write!(f, ":{branch}")?;
        }
        Ok(())
    }
}

impl PartialOrd for Xid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Xid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}
