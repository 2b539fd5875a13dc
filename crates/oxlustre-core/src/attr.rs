//! Wire attributes and attribute diffs.
//!
//! Every attribute reply carries an [`AttrValid`] mask: a field whose bit is
//! clear is absent and must never overwrite a cached value. Likewise a
//! [`SetAttr`] only names the fields marked in its [`SetAttrValid`] mask;
//! servers apply exactly those and leave every other field untouched.

use crate::fid::Fid;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// File mode bits (kept local so the wire format does not depend on the host `mode_t`).
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
    pub const S_ISUID: u32 = 0o4000;
    pub const S_ISGID: u32 = 0o2000;
    pub const S_ISVTX: u32 = 0o1000;
    pub const S_IALLUGO: u32 = 0o7777;
}

bitflags! {
    /// Validity mask for attribute replies and getattr requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AttrValid: u64 {
        const ID         = 1 << 0;
        const ATIME      = 1 << 1;
        const MTIME      = 1 << 2;
        const CTIME      = 1 << 3;
        const SIZE       = 1 << 4;
        const BLOCKS     = 1 << 5;
        const BLKSIZE    = 1 << 6;
        /// Permission bits of the mode.
        const MODE       = 1 << 7;
        /// File type bits of the mode.
        const TYPE       = 1 << 8;
        const UID        = 1 << 9;
        const GID        = 1 << 10;
        const FLAGS      = 1 << 11;
        const NLINK      = 1 << 12;
        const GENERATION = 1 << 13;
        const RDEV       = 1 << 14;
        /// Reply carries (or request asks for) the stripe metadata blob.
        const EASIZE     = 1 << 15;
        /// Reply carries (or request asks for) the symlink target.
        const LINKNAME   = 1 << 16;

        /// Attributes owned by storage targets.
        const STORAGE = Self::SIZE.bits() | Self::BLOCKS.bits() | Self::BLKSIZE.bits()
            | Self::MTIME.bits() | Self::CTIME.bits();
        /// Everything a plain getattr returns.
        const BASIC = Self::ID.bits() | Self::ATIME.bits() | Self::MTIME.bits()
            | Self::CTIME.bits() | Self::SIZE.bits() | Self::BLOCKS.bits()
            | Self::BLKSIZE.bits() | Self::MODE.bits() | Self::TYPE.bits()
            | Self::UID.bits() | Self::GID.bits() | Self::FLAGS.bits()
            | Self::NLINK.bits() | Self::GENERATION.bits() | Self::RDEV.bits();
    }
}

impl Default for AttrValid {
    fn default() -> Self {
        Self::empty()
    }
}

/// File type derived from the mode's type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// Decode the type bits of a mode. Returns `None` when the bits are not a known type.
    pub fn from_mode(m: u32) -> Option<Self> {
        match m & mode::S_IFMT {
            mode::S_IFREG => Some(Self::Regular),
            mode::S_IFDIR => Some(Self::Directory),
            mode::S_IFLNK => Some(Self::Symlink),
            mode::S_IFCHR => Some(Self::CharDevice),
            mode::S_IFBLK => Some(Self::BlockDevice),
            mode::S_IFIFO => Some(Self::Fifo),
            mode::S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            Self::Regular => mode::S_IFREG,
            Self::Directory => mode::S_IFDIR,
            Self::Symlink => mode::S_IFLNK,
            Self::CharDevice => mode::S_IFCHR,
            Self::BlockDevice => mode::S_IFBLK,
            Self::Fifo => mode::S_IFIFO,
            Self::Socket => mode::S_IFSOCK,
        }
    }
}

/// Attribute block as it travels on the wire.
///
/// Only the fields whose bit is set in `valid` carry meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireAttrs {
    pub valid: AttrValid,
    pub fid: Option<Fid>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub nlink: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub flags: u32,
    pub rdev: u32,
    /// Size of the stripe metadata blob the object carries (0 = none).
    pub easize: u32,
}

impl WireAttrs {
    pub fn file_type(&self) -> Option<FileType> {
        if self.valid.contains(AttrValid::TYPE) {
            FileType::from_mode(self.mode)
        } else {
            None
        }
    }

    /// Keep only the fields named in `mask`.
    #[must_use]
    pub fn project(mut self, mask: AttrValid) -> Self {
        self.valid &= mask;
        self
    }

    /// Apply a setattr diff, touching only the fields it names.
    pub fn apply(&mut self, attr: &SetAttr) {
        let v = attr.valid;
        if v.contains(SetAttrValid::MODE) {
            self.mode = (self.mode & mode::S_IFMT) | (attr.mode & mode::S_IALLUGO);
            self.valid |= AttrValid::MODE;
        }
        if v.contains(SetAttrValid::UID) {
            self.uid = attr.uid;
            self.valid |= AttrValid::UID;
        }
        if v.contains(SetAttrValid::GID) {
            self.gid = attr.gid;
            self.valid |= AttrValid::GID;
        }
        if v.contains(SetAttrValid::SIZE) {
            self.size = attr.size;
            self.valid |= AttrValid::SIZE;
        }
        if v.contains(SetAttrValid::ATIME) {
            self.atime = attr.atime;
            self.valid |= AttrValid::ATIME;
        }
        if v.contains(SetAttrValid::MTIME) {
            self.mtime = attr.mtime;
            self.valid |= AttrValid::MTIME;
        }
        if v.contains(SetAttrValid::CTIME) {
            self.ctime = attr.ctime;
            self.valid |= AttrValid::CTIME;
        }
    }
}

bitflags! {
    /// Fields named by a [`SetAttr`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SetAttrValid: u32 {
        const MODE      = 1 << 0;
        const UID       = 1 << 1;
        const GID       = 1 << 2;
        const SIZE      = 1 << 3;
        const ATIME     = 1 << 4;
        const MTIME     = 1 << 5;
        const CTIME     = 1 << 6;
        /// The caller supplied an explicit atime (otherwise "now").
        const ATIME_SET = 1 << 7;
        /// The caller supplied an explicit mtime (otherwise "now").
        const MTIME_SET = 1 << 8;
        const CTIME_SET = 1 << 9;
        /// Values were already resolved by a trusted caller; skip permission checks.
        const RAW       = 1 << 10;
        /// Truncate issued as part of an open with `O_TRUNC`.
        const FROM_OPEN = 1 << 11;

        /// Attributes that live on storage targets for striped files.
        const STORAGE = Self::SIZE.bits() | Self::ATIME.bits() | Self::MTIME.bits()
            | Self::CTIME.bits() | Self::ATIME_SET.bits() | Self::MTIME_SET.bits()
            | Self::CTIME_SET.bits();
    }
}

impl Default for SetAttrValid {
    fn default() -> Self {
        Self::empty()
    }
}

/// Attribute diff. Only the fields named in `valid` are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetAttr {
    pub valid: SetAttrValid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl SetAttr {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self.valid |= SetAttrValid::MODE;
        self
    }

    #[must_use]
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self.valid |= SetAttrValid::UID;
        self
    }

    #[must_use]
    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self.valid |= SetAttrValid::GID;
        self
    }

    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self.valid |= SetAttrValid::SIZE;
        self
    }

    /// Set an explicit access time.
    #[must_use]
    pub fn atime(mut self, secs: i64) -> Self {
        self.atime = secs;
        self.valid |= SetAttrValid::ATIME | SetAttrValid::ATIME_SET;
        self
    }

    /// Set an explicit modification time.
    #[must_use]
    pub fn mtime(mut self, secs: i64) -> Self {
        self.mtime = secs;
        self.valid |= SetAttrValid::MTIME | SetAttrValid::MTIME_SET;
        self
    }

    /// Touch atime and mtime with the current time (`utime(path, NULL)`).
    #[must_use]
    pub fn touch(mut self) -> Self {
        self.valid |= SetAttrValid::ATIME | SetAttrValid::MTIME;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: SetAttrValid) -> Self {
        self.valid |= flags;
        self
    }

    /// True when the diff names anything the metadata service must record.
    ///
    /// A bare size change (possibly flagged as coming from open) is handled
    /// entirely by the storage targets of a striped file.
    pub fn touches_metadata(&self) -> bool {
        !(self.valid - SetAttrValid::SIZE - SetAttrValid::RAW - SetAttrValid::FROM_OPEN)
            .is_empty()
    }
}

/// Seconds since the epoch, clamped to zero for clocks before 1970.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
