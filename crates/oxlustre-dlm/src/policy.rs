//! Lock policies: what part of a resource a lock protects.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Inode bits protected by a metadata lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct InodeBits: u32 {
        /// The name-to-inode mapping.
        const LOOKUP = 1 << 0;
        /// Inode attributes.
        const UPDATE = 1 << 1;
        /// Open state.
        const OPEN   = 1 << 2;
    }
}

/// End offset meaning "to end of file".
pub const EOF: u64 = u64::MAX;

/// Inclusive byte range, optionally tagged with a group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
    /// Group id; only meaningful for group locks.
    pub gid: u64,
}

impl Extent {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end, gid: 0 }
    }

    /// `[start, EOF]`.
    pub const fn to_eof(start: u64) -> Self {
        Self::new(start, EOF)
    }

    /// The whole object, tagged with a group id.
    pub const fn group(gid: u64) -> Self {
        Self {
            start: 0,
            end: EOF,
            gid,
        }
    }

    /// Extent covering `len` bytes at `offset`. Empty ranges cover the first byte.
    pub fn for_range(offset: u64, len: u64) -> Self {
        let end = offset.saturating_add(len.max(1) - 1);
        Self::new(offset, end)
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &Extent) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// What a lock protects within its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Policy {
    InodeBits(InodeBits),
    Extent(Extent),
}

impl Policy {
    /// True when the protected regions intersect.
    pub fn overlaps(&self, other: &Policy) -> bool {
        match (self, other) {
            (Policy::InodeBits(a), Policy::InodeBits(b)) => a.intersects(*b),
            (Policy::Extent(a), Policy::Extent(b)) => a.overlaps(b),
            // Different lock types on one resource always collide
            _ => true,
        }
    }

    /// True when `self` protects at least everything `requested` does.
    pub fn covers(&self, requested: &Policy) -> bool {
        match (self, requested) {
            (Policy::InodeBits(a), Policy::InodeBits(b)) => a.contains(*b),
            (Policy::Extent(a), Policy::Extent(b)) => a.contains(b) && a.gid == b.gid,
            _ => false,
        }
    }

    pub fn gid(&self) -> Option<u64> {
        match self {
            Policy::Extent(e) => Some(e.gid),
            Policy::InodeBits(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_disjoint_bits_do_not_overlap() {
        let lookup = Policy::InodeBits(InodeBits::LOOKUP);
        let update = Policy::InodeBits(InodeBits::UPDATE);
        assert!(!lookup.overlaps(&update));
        assert!(Policy::InodeBits(InodeBits::all()).overlaps(&update));
    }

    #[test]
    fn test_extent_overlap_edges() {
        let a = Extent::new(0, 99);
        assert!(a.overlaps(&Extent::new(99, 200)));
        assert!(!a.overlaps(&Extent::new(100, 200)));
        assert!(Extent::to_eof(50).overlaps(&Extent::new(u64::MAX, u64::MAX)));
    }

    #[test]
    fn test_for_range() {
        assert_eq!(Extent::for_range(10, 5), Extent::new(10, 14));
        assert_eq!(Extent::for_range(10, 0), Extent::new(10, 10));
        assert_eq!(Extent::for_range(u64::MAX - 1, 10).end, u64::MAX);
    }

    #[test]
    fn test_covers_requires_same_gid() {
        let held = Policy::Extent(Extent::group(7));
        assert!(held.covers(&Policy::Extent(Extent::group(7))));
        assert!(!held.covers(&Policy::Extent(Extent::group(8))));
        assert!(!held.covers(&Policy::InodeBits(InodeBits::UPDATE)));
    }

    proptest! {
        #[test]
        fn prop_overlap_symmetric(a0 in 0u64..1000, al in 0u64..100, b0 in 0u64..1000, bl in 0u64..100) {
            let a = Extent::new(a0, a0 + al);
            let b = Extent::new(b0, b0 + bl);
            prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
            if a.contains(&b) {
                prop_assert!(a.overlaps(&b));
            }
        }
    }
}
