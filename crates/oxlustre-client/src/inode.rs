//! Inode cache.
//!
//! Each cached inode keeps the last attributes merged from a server reply,
//! its stripe metadata and its lifecycle status. Lock callbacks never touch
//! the state directly: they arrive as [`LockNotice`] messages on the inode's
//! own channel and are drained under the state write lock before every
//! mutation, so readers see either the whole effect of a revocation or none
//! of it.

use crate::error::{ClientError, ClientResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use oxlustre_core::attr::mode;
use oxlustre_core::stripe::StripeMd;
use oxlustre_core::{AttrValid, Fid, FileType, MdBody, SetAttr, WireAttrs};
use oxlustre_dlm::{AstSink, LockClient, LockNotice, Policy, ResourceId};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OnceCell, mpsc};
use tracing::{debug, error, trace};

/// Validity bits an inode reply must carry to be cached.
pub const REQUIRED_VALID: AttrValid = AttrValid::ID
    .union(AttrValid::GENERATION)
    .union(AttrValid::TYPE);

/// Lifecycle of a cached inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeStatus {
    /// Allocated, no reply merged yet.
    Unpopulated,
    Populated,
    /// A lock protecting the attributes was lost; revalidate before trusting them.
    Stale,
    /// Forgotten; the record is no longer in the cache.
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct InodeState {
    pub attrs: WireAttrs,
    pub status: InodeStatus,
    pub stripe: Option<Arc<StripeMd>>,
    /// The local size was extended by a write and may be ahead of the targets.
    pub size_authority: bool,
    /// The metadata service reported a size.
    pub have_mds_size: bool,
}

/// POSIX-shaped attributes returned by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub fid: Fid,
    pub ino: u64,
    pub kind: FileType,
    /// Permission bits, without the type.
    pub perm: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub rdev: u32,
    pub flags: u32,
}

/// Merge a reply into cached attributes, field by field.
///
/// Fields without their validity bit are left alone, ctime never moves
/// backwards, and the type and permission halves of the mode are merged
/// independently.
pub fn merge_attrs(cached: &mut WireAttrs, reply: &WireAttrs) {
    let v = reply.valid;
    if reply.fid.is_some() {
        cached.fid = reply.fid;
    }
    if v.contains(AttrValid::TYPE) {
        cached.mode = (cached.mode & !mode::S_IFMT) | (reply.mode & mode::S_IFMT);
    }
    if v.contains(AttrValid::MODE) {
        cached.mode = (cached.mode & mode::S_IFMT) | (reply.mode & !mode::S_IFMT);
    }
    if v.contains(AttrValid::UID) {
        cached.uid = reply.uid;
    }
    if v.contains(AttrValid::GID) {
        cached.gid = reply.gid;
    }
    if v.contains(AttrValid::SIZE) {
        cached.size = reply.size;
    }
    if v.contains(AttrValid::BLOCKS) {
        cached.blocks = reply.blocks;
    }
    if v.contains(AttrValid::BLKSIZE) {
        cached.blksize = reply.blksize;
    }
    if v.contains(AttrValid::NLINK) {
        cached.nlink = reply.nlink;
    }
    if v.contains(AttrValid::ATIME) {
        cached.atime = reply.atime;
    }
    if v.contains(AttrValid::MTIME) {
        cached.mtime = reply.mtime;
    }
    if v.contains(AttrValid::CTIME) && (!cached.valid.contains(AttrValid::CTIME) || reply.ctime >= cached.ctime) {
        cached.ctime = reply.ctime;
    }
    if v.contains(AttrValid::FLAGS) {
        cached.flags = reply.flags;
    }
    if v.contains(AttrValid::RDEV) {
        cached.rdev = reply.rdev;
    }
    if v.contains(AttrValid::EASIZE) {
        cached.easize = reply.easize;
    }
    cached.valid |= v - AttrValid::LINKNAME;
}

/// A cached inode.
pub struct Inode {
    fid: Fid,
    /// Identifies this record's lock sinks.
    owner: u64,
    state: RwLock<InodeState>,
    notices: Mutex<mpsc::UnboundedReceiver<LockNotice>>,
    notice_tx: mpsc::UnboundedSender<LockNotice>,
    nlookup: AtomicU64,
    symlink: OnceCell<String>,
    /// Serializes object allocation on first open for write.
    open_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Inode")
            .field("fid", &self.fid)
            .field("status", &state.status)
            .field("size", &state.attrs.size)
            .field("striped", &state.stripe.is_some())
            .field("nlookup", &self.nlookup.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Inode {
    fn new(fid: Fid, owner: u64) -> Self {
        let (notice_tx, rx) = mpsc::unbounded_channel();
        Self {
            fid,
            owner,
            state: RwLock::new(InodeState {
                attrs: WireAttrs::default(),
                status: InodeStatus::Unpopulated,
                stripe: None,
                size_authority: false,
                have_mds_size: false,
            }),
            notices: Mutex::new(rx),
            notice_tx,
            nlookup: AtomicU64::new(0),
            symlink: OnceCell::new(),
            open_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn fid(&self) -> Fid {
        self.fid
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Sink to attach to locks protecting this inode.
    pub fn sink(&self) -> AstSink {
        AstSink {
            owner: self.owner,
            tx: self.notice_tx.clone(),
        }
    }

    /// Snapshot of the whole state.
    pub fn state(&self) -> InodeState {
        self.state.read().clone()
    }

    pub fn attrs(&self) -> WireAttrs {
        self.state.read().attrs
    }

    pub fn status(&self) -> InodeStatus {
        self.state.read().status
    }

    pub fn stripe(&self) -> Option<Arc<StripeMd>> {
        self.state.read().stripe.clone()
    }

    pub fn size(&self) -> u64 {
        self.state.read().attrs.size
    }

    pub fn size_authority(&self) -> bool {
        self.state.read().size_authority
    }

    pub fn file_type(&self) -> Option<FileType> {
        self.state.read().attrs.file_type()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    pub fn lookup_count(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }

    pub fn file_attr(&self) -> ClientResult<FileAttr> {
        let attrs = self.attrs();
        let kind = attrs
            .file_type()
            .ok_or_else(|| ClientError::Protocol(format!("{} has no file type", self.fid)))?;
        Ok(FileAttr {
            fid: self.fid,
            ino: self.fid.ino(),
            kind,
            perm: attrs.mode & mode::S_IALLUGO,
            nlink: attrs.nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            size: attrs.size,
            blocks: attrs.blocks,
            blksize: attrs.blksize,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            rdev: attrs.rdev,
            flags: attrs.flags,
        })
    }

    pub(crate) fn symlink_cell(&self) -> &OnceCell<String> {
        &self.symlink
    }

    pub(crate) fn open_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.open_gate
    }

    /// Apply pending lock notices.
    pub fn drain_notices(&self) {
        let mut state = self.state.write();
        self.drain_locked(&mut state);
    }

    fn drain_locked(&self, state: &mut InodeState) {
        let mut rx = self.notices.lock();
        while let Ok(notice) = rx.try_recv() {
            trace!(fid = %self.fid, reason = ?notice.reason, "Lock notice");
            match notice.policy {
                Policy::InodeBits(_) => {
                    if state.status == InodeStatus::Populated {
                        state.status = InodeStatus::Stale;
                    }
                }
                Policy::Extent(_) => {
                    // Another client may now change the size behind us
                    state.size_authority = false;
                }
            }
        }
    }

    /// Merge a metadata reply.
    ///
    /// Stripe metadata is checked first: a layout that differs from the
    /// cached one is a protocol violation and nothing is merged.
    pub fn merge(&self, body: &MdBody) -> ClientResult<()> {
        let incoming = match &body.stripe {
            Some(blob) => Some(StripeMd::from_bytes(blob)?),
            None => None,
        };

        let mut state = self.state.write();
        self.drain_locked(&mut state);
        if state.status == InodeStatus::Destroyed {
            return Ok(());
        }
        if let Some(md) = incoming {
            match &state.stripe {
                Some(cached) if !cached.same_layout(&md) => {
                    error!(fid = %self.fid, cached = ?cached.object, got = ?md.object, "Stripe metadata mismatch");
                    return Err(ClientError::StripeMismatch { fid: self.fid });
                }
                Some(_) => {}
                None => state.stripe = Some(Arc::new(md)),
            }
        }
        merge_attrs(&mut state.attrs, &body.attrs);
        if body.attrs.valid.contains(AttrValid::SIZE) {
            state.have_mds_size = true;
        }
        if body.attrs.valid.contains(REQUIRED_VALID) {
            state.status = InodeStatus::Populated;
        }
        drop(state);

        if let Some(target) = &body.linkname {
            // A concurrent fetch may have filled it already
            let _ = self.symlink.set(target.clone());
        }
        Ok(())
    }

    /// Merge storage attributes from a glimpse.
    ///
    /// With size authority the local size wins when it is larger; otherwise
    /// the targets' size is taken and the authority dropped.
    pub fn merge_storage(&self, attrs: &WireAttrs) {
        let mut state = self.state.write();
        self.drain_locked(&mut state);
        let mut attrs = *attrs;
        if attrs.valid.contains(AttrValid::SIZE) {
            if state.size_authority && state.attrs.size > attrs.size {
                debug!(fid = %self.fid, local = state.attrs.size, glimpsed = attrs.size, "Keeping local size");
                attrs.valid.remove(AttrValid::SIZE | AttrValid::BLOCKS);
            } else {
                state.size_authority = false;
            }
        }
        merge_attrs(&mut state.attrs, &attrs);
    }

    /// Attach stripe metadata allocated by this client.
    pub fn set_stripe(&self, md: Arc<StripeMd>) -> ClientResult<()> {
        let mut state = self.state.write();
        self.drain_locked(&mut state);
        match &state.stripe {
            Some(cached) if !cached.same_layout(&md) => {
                error!(fid = %self.fid, "Stripe metadata mismatch on allocation");
                Err(ClientError::StripeMismatch { fid: self.fid })
            }
            Some(_) => Ok(()),
            None => {
                state.stripe = Some(md);
                Ok(())
            }
        }
    }

    /// Apply a setattr the metadata service never saw.
    pub fn apply_local(&self, attr: &SetAttr) {
        let mut state = self.state.write();
        self.drain_locked(&mut state);
        state.attrs.apply(attr);
    }

    /// Record a write that ended at `end`.
    pub fn extend_size(&self, end: u64) {
        let mut state = self.state.write();
        self.drain_locked(&mut state);
        if end > state.attrs.size {
            state.attrs.size = end;
            state.attrs.valid |= AttrValid::SIZE;
            state.size_authority = true;
        }
    }

    /// Record a completed truncate.
    pub fn truncate_local(&self, size: u64) {
        let mut state = self.state.write();
        self.drain_locked(&mut state);
        state.attrs.size = size;
        state.attrs.valid |= AttrValid::SIZE;
        state.size_authority = false;
    }

    /// Force the next revalidation to go to the servers.
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        self.drain_locked(&mut state);
        if state.status == InodeStatus::Populated {
            state.status = InodeStatus::Stale;
        }
    }

    fn destroy(&self) -> Option<Arc<StripeMd>> {
        let mut state = self.state.write();
        self.drain_locked(&mut state);
        state.status = InodeStatus::Destroyed;
        state.size_authority = false;
        state.stripe.take()
    }
}

/// Fid-keyed cache of inodes with lookup counts.
pub struct InodeCache {
    map: DashMap<Fid, Arc<Inode>>,
    next_owner: AtomicU64,
    md_locks: LockClient,
    dt_locks: LockClient,
    root: Mutex<Option<Fid>>,
}

impl std::fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeCache")
            .field("inodes", &self.map.len())
            .field("root", &*self.root.lock())
            .finish_non_exhaustive()
    }
}

impl InodeCache {
    pub fn new(md_locks: LockClient, dt_locks: LockClient) -> Self {
        Self {
            map: DashMap::new(),
            next_owner: AtomicU64::new(1),
            md_locks,
            dt_locks,
            root: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, fid: &Fid) -> Option<Arc<Inode>> {
        self.map.get(fid).map(|e| Arc::clone(e.value()))
    }

    /// Pin an inode so [`forget`](Self::forget) never drops it.
    pub fn pin_root(&self, fid: Fid) {
        *self.root.lock() = Some(fid);
    }

    /// Find or create the inode a reply describes, merge the reply, and take
    /// a lookup reference.
    pub fn iget(&self, body: &MdBody) -> ClientResult<Arc<Inode>> {
        let attrs = &body.attrs;
        let fid = match attrs.fid {
            Some(fid) if attrs.valid.contains(REQUIRED_VALID) => fid,
            _ => {
                error!(valid = ?attrs.valid, "Inode reply lacks identity bits");
                return Err(ClientError::Protocol(
                    "inode reply lacks fid, generation or type".to_string(),
                ));
            }
        };

        let inode = match self.map.entry(fid) {
            Entry::Occupied(occupied) if occupied.get().status() != InodeStatus::Destroyed => {
                Arc::clone(occupied.get())
            }
            Entry::Occupied(mut occupied) => {
                let fresh = Arc::new(Inode::new(fid, self.next_owner.fetch_add(1, Ordering::Relaxed)));
                occupied.insert(Arc::clone(&fresh));
                fresh
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(Inode::new(fid, self.next_owner.fetch_add(1, Ordering::Relaxed)));
                vacant.insert(Arc::clone(&fresh));
                fresh
            }
        };
        inode.merge(body)?;
        inode.nlookup.fetch_add(1, Ordering::Relaxed);
        Ok(inode)
    }

    /// Drop `n` lookup references. At zero the inode is destroyed: its lock
    /// sinks are detached before it leaves the cache.
    pub fn forget(&self, fid: Fid, n: u64) {
        if *self.root.lock() == Some(fid) {
            return;
        }
        let Some(inode) = self.get(&fid) else {
            return;
        };
        let prev = inode
            .nlookup
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(n)))
            .unwrap_or(0);
        if prev > n {
            return;
        }
        self.evict(&inode);
    }

    /// Destroy an inode regardless of its lookup count.
    pub fn evict(&self, inode: &Arc<Inode>) {
        let fid = inode.fid;
        self.md_locks.clear_ast_data(ResourceId::from_fid(fid), inode.owner);
        if let Some(md) = inode.stripe() {
            self.dt_locks.clear_ast_data(ResourceId::from_object(md.object), inode.owner);
        }
        inode.destroy();
        self.map.remove_if(&fid, |_, cached| Arc::ptr_eq(cached, inode));
        debug!(%fid, "Inode destroyed");
    }
}
