//! Request/reply protocol spoken between the client and the services.
//!
//! Messages are serde enums encoded to opaque blobs; the transport never
//! looks inside them. [`Request::is_idempotent`] decides whether a request
//! may be resent after a timeout or a lost connection.

use crate::attr::{AttrValid, FileType, SetAttr, WireAttrs};
use crate::error::CodecError;
use crate::fid::{Fid, ObjectId};
use crate::statfs::ObdStatfs;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request to a metadata service or storage target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Connect {
        client: Uuid,
    },
    Disconnect {
        cookie: u64,
    },

    /// Root fid of the namespace.
    GetStatus,
    Getattr {
        fid: Fid,
        valid: AttrValid,
    },
    Lookup {
        parent: Fid,
        name: String,
        valid: AttrValid,
    },
    Create {
        parent: Fid,
        name: String,
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        /// Target of a symlink.
        target: Option<String>,
        /// Stripe metadata blob for a regular file with pre-allocated objects.
        stripe: Option<Bytes>,
    },
    Setattr {
        fid: Fid,
        attr: SetAttr,
    },
    /// Attach a stripe metadata blob to a regular file that has none.
    SetStripe {
        fid: Fid,
        stripe: Bytes,
    },
    Link {
        fid: Fid,
        parent: Fid,
        name: String,
    },
    Unlink {
        parent: Fid,
        name: String,
        /// Expected type: `S_IFDIR` for rmdir, 0 for unlink.
        kind: u32,
    },
    Rename {
        src_parent: Fid,
        src_name: String,
        tgt_parent: Fid,
        tgt_name: String,
    },
    ReadPage {
        fid: Fid,
        page: u64,
    },
    Statfs,

    ObjCreate {
        group: u64,
    },
    ObjDestroy {
        object: ObjectId,
    },
    ObjGetattr {
        object: ObjectId,
        valid: AttrValid,
    },
    ObjSetattr {
        object: ObjectId,
        attr: SetAttr,
    },
    /// Drop object data in `[start, end]`; `end == u64::MAX` truncates to `start`.
    ObjPunch {
        object: ObjectId,
        start: u64,
        end: u64,
    },
    /// Stage a read under the client-chosen `token`; the reply carries the
    /// data. A resend with the same token replaces the staged entry.
    PrepRead {
        token: u64,
        object: ObjectId,
        offset: u64,
        len: u64,
    },
    /// Stage a write under the client-chosen `token`; nothing is visible
    /// until the token is committed.
    PrepWrite {
        token: u64,
        object: ObjectId,
        offset: u64,
        data: Bytes,
    },
    Commit {
        token: u64,
    },
}

/// Discriminant of a [`Request`], used for logging and fault filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Connect,
    Disconnect,
    GetStatus,
    Getattr,
    Lookup,
    Create,
    Setattr,
    SetStripe,
    Link,
    Unlink,
    Rename,
    ReadPage,
    Statfs,
    ObjCreate,
    ObjDestroy,
    ObjGetattr,
    ObjSetattr,
    ObjPunch,
    PrepRead,
    PrepWrite,
    Commit,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Connect { .. } => Opcode::Connect,
            Self::Disconnect { .. } => Opcode::Disconnect,
            Self::GetStatus => Opcode::GetStatus,
            Self::Getattr { .. } => Opcode::Getattr,
            Self::Lookup { .. } => Opcode::Lookup,
            Self::Create { .. } => Opcode::Create,
            Self::Setattr { .. } => Opcode::Setattr,
            Self::SetStripe { .. } => Opcode::SetStripe,
            Self::Link { .. } => Opcode::Link,
            Self::Unlink { .. } => Opcode::Unlink,
            Self::Rename { .. } => Opcode::Rename,
            Self::ReadPage { .. } => Opcode::ReadPage,
            Self::Statfs => Opcode::Statfs,
            Self::ObjCreate { .. } => Opcode::ObjCreate,
            Self::ObjDestroy { .. } => Opcode::ObjDestroy,
            Self::ObjGetattr { .. } => Opcode::ObjGetattr,
            Self::ObjSetattr { .. } => Opcode::ObjSetattr,
            Self::ObjPunch { .. } => Opcode::ObjPunch,
            Self::PrepRead { .. } => Opcode::PrepRead,
            Self::PrepWrite { .. } => Opcode::PrepWrite,
            Self::Commit { .. } => Opcode::Commit,
        }
    }

    /// Whether a resend after an unknown outcome is harmless.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.opcode(),
            Opcode::Connect
                | Opcode::Disconnect
                | Opcode::GetStatus
                | Opcode::Getattr
                | Opcode::Lookup
                | Opcode::ReadPage
                | Opcode::Statfs
                | Opcode::ObjGetattr
                | Opcode::PrepRead
                | Opcode::PrepWrite
        )
    }
}

/// Metadata reply body: attributes plus optional stripe blob and link name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MdBody {
    pub attrs: WireAttrs,
    pub stripe: Option<Bytes>,
    pub linkname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub fid: Fid,
    pub kind: FileType,
}

/// A reply from a metadata service or storage target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Connected {
        cookie: u64,
    },
    Done,
    Status {
        root: Fid,
    },
    Body(MdBody),
    /// Result of unlink/rename: the body of the inode that lost a name, if any.
    /// Its stripe blob is present only when that was its last link.
    Removed(Option<MdBody>),
    Page {
        entries: Vec<DirEntry>,
        last: bool,
    },
    Statfs(ObdStatfs),
    Object {
        object: ObjectId,
        attrs: WireAttrs,
    },
    Prepared {
        token: u64,
        data: Bytes,
    },
    Committed {
        bytes: u64,
    },
    Error {
        errno: i32,
    },
}

impl Reply {
    /// Short name used in protocol error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Done => "done",
            Self::Status { .. } => "status",
            Self::Body(_) => "body",
            Self::Removed(_) => "removed",
            Self::Page { .. } => "page",
            Self::Statfs(_) => "statfs",
            Self::Object { .. } => "object",
            Self::Prepared { .. } => "prepared",
            Self::Committed { .. } => "committed",
            Self::Error { .. } => "error",
        }
    }
}

/// Encode a message to a blob.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a blob into a message.
pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(raw).map_err(|e| CodecError::Decode(e.to_string()))
}
