//! Object identity.
//!
//! A [`Fid`] names a metadata object (inode) on the metadata service and is
//! stable across renames. An [`ObjectId`] names a storage object on a storage
//! target; a striped file owns one storage object per stripe.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata object identifier.
///
/// The generation disambiguates reuse of the same inode number: two fids with
/// equal `id` but different `generation` name different objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fid {
    /// Inode number on the metadata service.
    pub id: u64,
    /// Generation counter for the inode number.
    pub generation: u32,
    /// Object group (metadata sequence).
    pub group: u64,
}

impl Fid {
    /// Create a fid.
    pub const fn new(id: u64, generation: u32, group: u64) -> Self {
        Self {
            id,
            generation,
            group,
        }
    }

    /// Inode number exposed to POSIX callers.
    #[inline]
    pub const fn ino(&self) -> u64 {
        self.id
    }

    /// True for the all-zero fid, which never names a live object.
    pub const fn is_zero(&self) -> bool {
        self.id == 0 && self.generation == 0 && self.group == 0
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}:0x{:x}:{}]", self.id, self.generation, self.group)
    }
}

/// Storage object identifier on a storage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub id: u64,
    pub group: u64,
}

impl ObjectId {
    pub const fn new(id: u64, group: u64) -> Self {
        Self { id, group }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:{}", self.id, self.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fid_display() {
        let fid = Fid::new(0x2a, 3, 0);
        assert_eq!(fid.to_string(), "[0x2a:0x3:0]");
        assert_eq!(fid.ino(), 42);
    }

    #[test]
    fn test_generation_distinguishes_fids() {
        let a = Fid::new(7, 1, 0);
        let b = Fid::new(7, 2, 0);
        assert_ne!(a, b);
        assert_eq!(a.ino(), b.ino());
        assert!(!a.is_zero());
        assert!(Fid::new(0, 0, 0).is_zero());
    }
}
