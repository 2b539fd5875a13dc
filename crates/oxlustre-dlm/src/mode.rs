//! Lock modes and their compatibility.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock mode.
///
/// | held \ req | EX | PW | PR | CW | CR | NL |
/// |------------|----|----|----|----|----|----|
/// | EX         |    |    |    |    |    | ok |
/// | PW         |    |    |    |    | ok | ok |
/// | PR         |    |    | ok |    | ok | ok |
/// | CW         |    |    |    | ok | ok | ok |
/// | CR         |    | ok | ok | ok | ok | ok |
/// | NL         | ok | ok | ok | ok | ok | ok |
///
/// `Group` is compatible with `Nl`, and with `Group` locks of the same group
/// id (the id lives in the extent policy, see [`crate::Policy`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Exclusive.
    Ex,
    /// Protected write.
    Pw,
    /// Protected read.
    Pr,
    /// Concurrent write.
    Cw,
    /// Concurrent read.
    Cr,
    /// Null (no access, keeps the lock alive).
    Nl,
    /// Cooperative group lock.
    Group,
}

impl LockMode {
    /// Mode compatibility ignoring group ids.
    ///
    /// Two `Group` modes report compatible here; the caller must compare the
    /// group ids.
    pub fn compatible(self, other: LockMode) -> bool {
        use LockMode::{Cr, Cw, Ex, Group, Nl, Pr, Pw};
        match (self, other) {
            (Nl, _) | (_, Nl) => true,
            (Group, Group) => true,
            (Group, _) | (_, Group) => false,
            (Ex, _) | (_, Ex) => false,
            (Pw, Cr) | (Cr, Pw) => true,
            (Pw, _) | (_, Pw) => false,
            (Pr, Pr | Cr) | (Cr, Pr) => true,
            (Cw, Cw | Cr) | (Cr, Cw) => true,
            (Cr, Cr) => true,
            (Pr, Cw) | (Cw, Pr) => false,
        }
    }

    /// True when a lock held in `self` serves a request for `requested`.
    pub fn covers(self, requested: LockMode) -> bool {
        use LockMode::{Cr, Cw, Ex, Group, Nl, Pr, Pw};
        match self {
            Group => requested == Group,
            Ex => requested != Group,
            Pw => matches!(requested, Pw | Pr | Cw | Cr | Nl),
            Pr => matches!(requested, Pr | Cr | Nl),
            Cw => matches!(requested, Cw | Cr | Nl),
            Cr => matches!(requested, Cr | Nl),
            Nl => requested == Nl,
        }
    }

    /// Whether the mode allows modifying the protected state.
    pub fn is_write(self) -> bool {
        matches!(self, LockMode::Ex | LockMode::Pw | LockMode::Cw | LockMode::Group)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::Ex => "EX",
            LockMode::Pw => "PW",
            LockMode::Pr => "PR",
            LockMode::Cw => "CW",
            LockMode::Cr => "CR",
            LockMode::Nl => "NL",
            LockMode::Group => "GROUP",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::LockMode::{self, *};

    const ALL: [LockMode; 7] = [Ex, Pw, Pr, Cw, Cr, Nl, Group];

    #[test]
    fn test_compatibility_matrix() {
        let expected = [
            // EX     PW     PR     CW     CR     NL
            [false, false, false, false, false, true],
            [false, false, false, false, true, true],
            [false, false, true, false, true, true],
            [false, false, false, true, true, true],
            [false, true, true, true, true, true],
            [true, true, true, true, true, true],
        ];
        for (i, a) in ALL[..6].iter().enumerate() {
            for (j, b) in ALL[..6].iter().enumerate() {
                assert_eq!(a.compatible(*b), expected[i][j], "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_compatibility_is_symmetric() {
        for a in ALL {
            for b in ALL {
                assert_eq!(a.compatible(b), b.compatible(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_group_only_with_group_or_null() {
        for m in [Ex, Pw, Pr, Cw, Cr] {
            assert!(!Group.compatible(m));
        }
        assert!(Group.compatible(Nl));
        assert!(Group.compatible(Group));
    }

    #[test]
    fn test_covers() {
        assert!(Pw.covers(Pr));
        assert!(Ex.covers(Pw));
        assert!(!Pr.covers(Pw));
        assert!(!Cw.covers(Pr));
        assert!(!Ex.covers(Group));
        assert!(Group.covers(Group));
        for m in ALL {
            assert!(m.covers(m), "{m} must cover itself");
        }
    }
}
