//! Lock resources and lock identities.

use oxlustre_core::{Fid, ObjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name of a lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub [u64; 3]);

impl ResourceId {
    /// Metadata resource of an inode.
    pub fn from_fid(fid: Fid) -> Self {
        Self([fid.id, u64::from(fid.generation), fid.group])
    }

    /// Data resource of a striped object.
    pub fn from_object(object: ObjectId) -> Self {
        Self([object.id, 0, object.group])
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}:0x{:x}:0x{:x}]", self.0[0], self.0[1], self.0[2])
    }
}

/// Identity of a lock client (one per mounted session and namespace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a lock, chosen by the requesting client before enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockCookie {
    pub client: ClientId,
    pub seq: u64,
}

impl fmt::Display for LockCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.client, self.seq)
    }
}
