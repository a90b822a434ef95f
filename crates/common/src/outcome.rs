//! Resource outcome codes and their severity ranking
//!
//! Outcomes are declared from most to least severe, so the derived `Ord`
//! is the ranking: a smaller value dominates when results are combined.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome reported by a resource manager, or computed for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Outcome {
    HeuristicHazard,
    HeuristicMixed,
    HeuristicCommit,
    HeuristicRollback,
    ResourceFail,
    ResourceError,
    RollbackIntegrity,
    RollbackCommFail,
    RollbackUnspecified,
    RollbackOther,
    RollbackDeadlock,
    Protocol,
    RollbackProtocol,
    RollbackTimeout,
    RollbackTransient,
    InvalidArgument,
    NoMigrate,
    Outside,
    Async,
    Retry,
    DuplicateId,
    NotFound,
    Ok,
    ReadOnly,
}

impl Outcome {
    /// Every outcome, most severe first
    pub const ALL: [Outcome; 24] = [
        Outcome::HeuristicHazard,
        Outcome::HeuristicMixed,
        Outcome::HeuristicCommit,
        Outcome::HeuristicRollback,
        Outcome::ResourceFail,
        Outcome::ResourceError,
        Outcome::RollbackIntegrity,
        Outcome::RollbackCommFail,
        Outcome::RollbackUnspecified,
        Outcome::RollbackOther,
        Outcome::RollbackDeadlock,
        Outcome::Protocol,
        Outcome::RollbackProtocol,
        Outcome::RollbackTimeout,
        Outcome::RollbackTransient,
        Outcome::InvalidArgument,
        Outcome::NoMigrate,
        Outcome::Outside,
        Outcome::Async,
        Outcome::Retry,
        Outcome::DuplicateId,
        Outcome::NotFound,
        Outcome::Ok,
        Outcome::ReadOnly,
    ];

    /// The more severe of two outcomes
    pub fn severest(self, other: Outcome) -> Outcome {
        self.min(other)
    }

    /// Fold outcomes into one. An empty set folds to `ReadOnly`: nothing had
    /// anything to do.
    pub fn fold<I>(outcomes: I) -> Outcome
    where
        I: IntoIterator<Item = Outcome>,
    {
        outcomes
            .into_iter()
            .fold(Outcome::ReadOnly, Outcome::severest)
    }

    /// True for `Ok` and `ReadOnly`
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Ok | Outcome::ReadOnly)
    }

    /// XA return code
    pub fn code(&self) -> i32 {
        match self {
            Outcome::RollbackUnspecified => 100,
            Outcome::RollbackCommFail => 101,
            Outcome::RollbackDeadlock => 102,
            Outcome::RollbackIntegrity => 103,
            Outcome::RollbackOther => 104,
            Outcome::RollbackProtocol => 105,
            Outcome::RollbackTimeout => 106,
            Outcome::RollbackTransient => 107,
            Outcome::NoMigrate => 9,
            Outcome::HeuristicHazard => 8,
            Outcome::HeuristicCommit => 7,
            Outcome::HeuristicRollback => 6,
            Outcome::HeuristicMixed => 5,
            Outcome::Retry => 4,
            Outcome::ReadOnly => 3,
            Outcome::Ok => 0,
            Outcome::Async => -2,
            Outcome::ResourceError => -3,
            Outcome::NotFound => -4,
            Outcome::InvalidArgument => -5,
            Outcome::Protocol => -6,
            Outcome::ResourceFail => -7,
            Outcome::DuplicateId => -8,
            Outcome::Outside => -9,
        }
    }

    /// Map an XA return code, `None` if the code is not part of the vocabulary
    pub fn try_from_code(code: i32) -> Option<Outcome> {
        Outcome::ALL
            .iter()
            .copied()
            .find(|outcome| outcome.code() == code)
    }

    /// Map an XA return code. Unrecognized codes are logged and treated as a
    /// resource error.
    pub fn from_code(code: i32) -> Outcome {
        Self::try_from_code(code).unwrap_or_else(|| {
            tracing::error!("unexpected resource outcome code {}, treating as resource error", code);
            Outcome::ResourceError
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::HeuristicHazard => "XA_HEURHAZ",
            Outcome::HeuristicMixed => "XA_HEURMIX",
            Outcome::HeuristicCommit => "XA_HEURCOM",
            Outcome::HeuristicRollback => "XA_HEURRB",
            Outcome::ResourceFail => "XAER_RMFAIL",
            Outcome::ResourceError => "XAER_RMERR",
            Outcome::RollbackIntegrity => "XA_RBINTEGRITY",
            Outcome::RollbackCommFail => "XA_RBCOMMFAIL",
            Outcome::RollbackUnspecified => "XA_RBROLLBACK",
            Outcome::RollbackOther => "XA_RBOTHER",
            Outcome::RollbackDeadlock => "XA_RBDEADLOCK",
            Outcome::Protocol => "XAER_PROTO",
            Outcome::RollbackProtocol => "XA_RBPROTO",
            Outcome::RollbackTimeout => "XA_RBTIMEOUT",
            Outcome::RollbackTransient => "XA_RBTRANSIENT",
            Outcome::InvalidArgument => "XAER_INVAL",
            Outcome::NoMigrate => "XA_NOMIGRATE",
            Outcome::Outside => "XAER_OUTSIDE",
            Outcome::Async => "XAER_ASYNC",
            Outcome::Retry => "XA_RETRY",
            Outcome::DuplicateId => "XAER_DUPID",
            Outcome::NotFound => "XAER_NOTA",
            Outcome::Ok => "XA_OK",
            Outcome::ReadOnly => "XA_RDONLY",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn outcome() -> impl Strategy<Value = Outcome> {
        (0..Outcome::ALL.len()).prop_map(|i| Outcome::ALL[i])
    }

    #[test]
    fn test_ranking_order() {
        assert!(Outcome::HeuristicHazard < Outcome::HeuristicMixed);
        assert!(Outcome::ResourceFail < Outcome::ResourceError);
        assert!(Outcome::RollbackDeadlock < Outcome::RollbackTimeout);
        assert!(Outcome::RollbackUnspecified < Outcome::RollbackOther);
        assert!(Outcome::NotFound < Outcome::Ok);
        assert!(Outcome::Ok < Outcome::ReadOnly);

        let mut sorted = Outcome::ALL;
        sorted.sort();
        assert_eq!(sorted, Outcome::ALL);
    }

    #[test]
    fn test_severest() {
        assert_eq!(Outcome::Ok.severest(Outcome::RollbackOther), Outcome::RollbackOther);
        assert_eq!(Outcome::ReadOnly.severest(Outcome::Ok), Outcome::Ok);
        assert_eq!(
            Outcome::ResourceError.severest(Outcome::HeuristicMixed),
            Outcome::HeuristicMixed
        );
    }

    #[test]
    fn test_fold() {
        assert_eq!(Outcome::fold(Vec::<Outcome>::new()), Outcome::ReadOnly);
        assert_eq!(Outcome::fold([Outcome::Ok, Outcome::ReadOnly]), Outcome::Ok);
        assert_eq!(
            Outcome::fold([Outcome::Ok, Outcome::RollbackOther, Outcome::ReadOnly]),
            Outcome::RollbackOther
        );
    }

    #[test]
    fn test_codes() {
        for outcome in Outcome::ALL {
            assert_eq!(Outcome::try_from_code(outcome.code()), Some(outcome));
        }
        assert_eq!(Outcome::from_code(0), Outcome::Ok);
        assert_eq!(Outcome::from_code(104), Outcome::RollbackOther);
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(Outcome::try_from_code(4711), None);
        assert_eq!(Outcome::from_code(4711), Outcome::ResourceError);
        assert_eq!(Outcome::from_code(-1), Outcome::ResourceError);
    }

    #[test]
    fn test_serde() {
        let json = serde_json::to_string(&Outcome::HeuristicMixed).unwrap();
        assert_eq!(serde_json::from_str::<Outcome>(&json).unwrap(), Outcome::HeuristicMixed);
    }

    proptest! {
        #[test]
        fn prop_severest_is_commutative(a in outcome(), b in outcome()) {
            prop_assert_eq!(a.severest(b), b.severest(a));
        }

        #[test]
        fn prop_severest_is_associative(a in outcome(), b in outcome(), c in outcome()) {
            prop_assert_eq!(a.severest(b).severest(c), a.severest(b.severest(c)));
        }

        #[test]
        fn prop_severest_never_improves(a in outcome(), b in outcome()) {
            let result = a.severest(b);
            prop_assert!(result <= a && result <= b);
            prop_assert!(result == a || result == b);
        }

        #[test]
        fn prop_fold_ignores_order(mut outcomes in proptest::collection::vec(outcome(), 0..16), seed in any::<u64>()) {
            let expected = Outcome::fold(outcomes.clone());
            let len = outcomes.len();
            if len > 1 {
                outcomes.rotate_left((seed as usize) % len);
                outcomes.swap(0, len - 1);
            }
            prop_assert_eq!(Outcome::fold(outcomes), expected);
        }
    }
}
