//! XA flags carried on resource requests

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Flags(pub u64);

impl Flags {
    pub const NO_FLAGS: Flags = Flags(0);

    /// Commit in a single phase, skipping prepare (TMONEPHASE)
    pub const ONE_PHASE: Flags = Flags(0x4000_0000);

    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let flags = Flags::NO_FLAGS | Flags::ONE_PHASE;
        assert!(flags.contains(Flags::ONE_PHASE));
        assert!(!Flags::NO_FLAGS.contains(Flags::ONE_PHASE));
        assert!(Flags::default().is_empty());
    }
}
