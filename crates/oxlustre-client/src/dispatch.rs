//! Filesystem operations.
//!
//! Every POSIX-shaped entry point of a mounted [`Session`] lives here. Each
//! one resolves its inodes through the cache, revalidates where attributes
//! matter, takes the locks the operation needs and talks to the metadata
//! client or the striping layer.

use crate::error::{ClientError, ClientResult, ErrorCategory};
use crate::file::{GroupLock, OpenFlags};
use crate::inode::{FileAttr, Inode};
use crate::mdc::NodeSpec;
use crate::obd::{CreateSpec, ObdOps};
use crate::session::Session;
use bytes::Bytes;
use oxlustre_core::attr::{mode, now_secs};
use oxlustre_core::{AttrValid, DirEntry, Fid, FileType, MdBody, ObdStatfs, SetAttr, SetAttrValid, StatVfs, StripeMd};
use oxlustre_dlm::{Extent, LockFlags, LockMode, Policy, ResourceId, ScopedLock};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Longest accepted name component.
pub const NAME_MAX: usize = 255;

/// Requests accepted by [`Session::ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    /// Take a group lock on the whole file through this descriptor.
    GroupLock(u64),
    /// Drop the group lock taken with this group id.
    GroupUnlock(u64),
}

/// Requests accepted by [`Session::fcntl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fcntl {
    GetFl,
    SetFl(OpenFlags),
}

/// Flags `F_SETFL` accepts but this client cannot honour.
const UNSUPPORTED_SETFL: OpenFlags = OpenFlags::NONBLOCK.union(OpenFlags::ASYNC);

/// Times a size change implies.
const TRUNCATE_TIMES: SetAttrValid = SetAttrValid::MTIME.union(SetAttrValid::CTIME);

fn check_name(op: &'static str, name: &str) -> ClientResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(ClientError::errno(op, libc::EINVAL));
    }
    if name.len() > NAME_MAX {
        return Err(ClientError::errno(op, libc::ENAMETOOLONG));
    }
    Ok(())
}

fn data_resource(md: &StripeMd) -> ResourceId {
    ResourceId::from_object(md.object)
}

impl Session {
    /// Cached inode for `fid`, loading it from the metadata service on a miss.
    async fn resolve(&self, fid: Fid) -> ClientResult<Arc<Inode>> {
        if let Some(inode) = self.inodes.get(&fid) {
            return Ok(inode);
        }
        let body = self
            .mdc
            .getattr_full(fid, AttrValid::BASIC | AttrValid::EASIZE)
            .await?;
        self.inodes.iget(&body)
    }

    /// A directory that can take one more link.
    async fn link_target_dir(&self, op: &'static str, parent: Fid) -> ClientResult<Arc<Inode>> {
        let dir = self.resolve(parent).await?;
        self.revalidate(&dir).await?;
        if !dir.is_dir() {
            return Err(ClientError::errno(op, libc::ENOTDIR));
        }
        self.check_link_ceiling(op, &dir)?;
        Ok(dir)
    }

    fn check_link_ceiling(&self, op: &'static str, inode: &Inode) -> ClientResult<()> {
        let nlink = inode.attrs().nlink;
        if nlink >= self.config.max_link_count {
            debug!(fid = %inode.fid(), nlink, "Link count ceiling reached");
            return Err(ClientError::errno(op, libc::EMLINK));
        }
        Ok(())
    }

    async fn create_node(&self, spec: NodeSpec) -> ClientResult<Arc<Inode>> {
        let parent = spec.parent;
        let body = self.mdc.create_node(spec).await?;
        let inode = self.inodes.iget(&body)?;
        self.invalidate_cached(parent);
        Ok(inode)
    }

    fn invalidate_cached(&self, fid: Fid) {
        if let Some(inode) = self.inodes.get(&fid) {
            inode.invalidate();
        }
    }

    fn node_spec(&self, parent: Fid, name: &str, mode: u32) -> NodeSpec {
        let creds = self.config.credentials;
        NodeSpec {
            parent,
            name: name.to_string(),
            mode,
            uid: creds.uid,
            gid: creds.gid,
            rdev: 0,
            target: None,
            stripe: None,
        }
    }

    /// Look up `name` in `parent`.
    #[instrument(level = "debug", skip(self), fields(%parent))]
    pub async fn lookup(&self, parent: Fid, name: &str) -> ClientResult<FileAttr> {
        self.check_mounted()?;
        check_name("lookup", name)?;
        let body = self
            .mdc
            .lookup(parent, name, AttrValid::BASIC | AttrValid::EASIZE)
            .await?;
        let inode = self.inodes.iget(&body)?;
        if inode.stripe().is_some() {
            self.glimpse(&inode).await?;
        }
        inode.file_attr()
    }

    pub async fn getattr(&self, fid: Fid) -> ClientResult<FileAttr> {
        self.check_mounted()?;
        let inode = self.resolve(fid).await?;
        self.revalidate(&inode).await?;
        inode.file_attr()
    }

    /// Change attributes.
    ///
    /// A size change on a striped file truncates its objects under a PW
    /// extent lock from the new size to end of file. Metadata-only changes
    /// go to the metadata service; a bare time update on a striped file is
    /// sent to the storage targets instead.
    #[instrument(level = "debug", skip(self, attr), fields(%fid, valid = ?attr.valid))]
    pub async fn setattr(&self, fid: Fid, attr: SetAttr) -> ClientResult<FileAttr> {
        self.check_mounted()?;
        let inode = self.resolve(fid).await?;
        self.revalidate(&inode).await?;
        self.setattr_inode(&inode, attr).await?;
        inode.file_attr()
    }

    async fn setattr_inode(&self, inode: &Arc<Inode>, requested: SetAttr) -> ClientResult<()> {
        let fid = inode.fid();
        let md = inode.stripe();
        let mut attr = requested;

        if attr.valid.contains(SetAttrValid::SIZE) {
            match inode.file_type() {
                Some(FileType::Regular) => {}
                Some(FileType::Directory) => return Err(ClientError::errno("setattr", libc::EISDIR)),
                _ => return Err(ClientError::errno("setattr", libc::EINVAL)),
            }
            let limit = md
                .as_ref()
                .map_or(self.config.max_file_bytes, |md| {
                    md.max_file_bytes().min(self.config.max_file_bytes)
                });
            if attr.size > limit {
                return Err(ClientError::errno("setattr", libc::EFBIG));
            }
            attr.valid |= TRUNCATE_TIMES;
        }

        let now = now_secs();
        if attr.valid.contains(SetAttrValid::CTIME) {
            attr.ctime = now;
            attr.valid |= SetAttrValid::CTIME_SET;
        }
        if attr.valid.contains(SetAttrValid::ATIME) && !attr.valid.contains(SetAttrValid::ATIME_SET) {
            attr.atime = now;
            attr.valid |= SetAttrValid::ATIME_SET;
        }
        if attr.valid.contains(SetAttrValid::MTIME) && !attr.valid.contains(SetAttrValid::MTIME_SET) {
            attr.mtime = now;
            attr.valid |= SetAttrValid::MTIME_SET;
        }

        let striped_regular = md.is_some() && inode.file_type() == Some(FileType::Regular);
        if md.is_none() || requested.touches_metadata() {
            let mut md_attr = attr;
            if md.is_some() {
                md_attr.valid.remove(SetAttrValid::SIZE);
            }
            match self.mdc.setattr_full(fid, &md_attr).await {
                Ok(body) => inode.merge(&body)?,
                Err(e) => {
                    if e.category() != ErrorCategory::Permission {
                        error!(%fid, error = %e, "Metadata setattr failed");
                    }
                    return Err(e);
                }
            }
            if !striped_regular {
                return Ok(());
            }
        } else if attr.valid.intersects(SetAttrValid::ATIME | SetAttrValid::MTIME) {
            self.check_time_permission(inode, requested)?;
        }

        // Without objects the size lives only on the metadata service, which
        // took it above. There is no data to punch and no extent to lock.
        let Some(md) = md else {
            return Ok(());
        };
        if requested.valid.contains(SetAttrValid::SIZE) {
            self.truncate(inode, &md, attr.size).await
        } else if attr.valid.intersects(SetAttrValid::MTIME | SetAttrValid::MTIME_SET) {
            let mut times = attr;
            times.valid &= SetAttrValid::STORAGE - SetAttrValid::SIZE;
            let attrs = self.lov.setattr(&md, &times).await.inspect_err(|e| {
                error!(%fid, error = %e, "Storage setattr failed");
            })?;
            inode.merge_storage(&attrs);
            inode.apply_local(&times);
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Time changes that never reach the metadata service are checked here.
    /// Explicit times need ownership; "now" needs write permission.
    fn check_time_permission(&self, inode: &Inode, requested: SetAttr) -> ClientResult<()> {
        let creds = self.config.credentials;
        let attrs = inode.attrs();
        if creds.privileged || attrs.uid == creds.uid {
            return Ok(());
        }
        let explicit = requested
            .valid
            .intersects(SetAttrValid::ATIME_SET | SetAttrValid::MTIME_SET);
        if explicit {
            return Err(ClientError::errno("setattr", libc::EPERM));
        }
        let writable = if attrs.gid == creds.gid {
            attrs.mode & 0o020 != 0
        } else {
            attrs.mode & 0o002 != 0
        };
        if writable {
            Ok(())
        } else {
            Err(ClientError::errno("setattr", libc::EACCES))
        }
    }

    /// Truncate the objects of `md` to `size`.
    ///
    /// The PW extent lock `[size, EOF]` is taken before the punch and
    /// released after it whether or not the punch succeeded.
    async fn truncate(&self, inode: &Arc<Inode>, md: &Arc<StripeMd>, size: u64) -> ClientResult<()> {
        let flags = if size == 0 {
            LockFlags::DISCARD_DATA
        } else {
            LockFlags::empty()
        };
        let handle = self
            .dt_locks
            .acquire(
                data_resource(md),
                LockMode::Pw,
                Policy::Extent(Extent::to_eof(size)),
                flags,
                Some(inode.sink()),
            )
            .await?;
        let lock = ScopedLock::new(self.dt_locks.clone(), handle);

        let punched = self.lov.punch(md, size).await;
        match &punched {
            Ok(()) => inode.truncate_local(size),
            Err(e) => error!(fid = %inode.fid(), size, error = %e, "Truncate failed"),
        }

        let released = lock.release().map_err(ClientError::from);
        if let Err(e) = &released {
            error!(fid = %inode.fid(), error = %e, "Extent unlock after truncate failed");
        }
        punched.and(released)
    }

    /// Create a special file or a regular file without opening it.
    pub async fn mknod(&self, parent: Fid, name: &str, mode: u32, rdev: u32) -> ClientResult<FileAttr> {
        self.check_mounted()?;
        check_name("mknod", name)?;
        let mut mode = mode & !self.config.credentials.umask;
        match mode & mode::S_IFMT {
            0 | mode::S_IFREG => mode = (mode & !mode::S_IFMT) | mode::S_IFREG,
            mode::S_IFCHR | mode::S_IFBLK | mode::S_IFIFO | mode::S_IFSOCK => {}
            mode::S_IFDIR => return Err(ClientError::errno("mknod", libc::EPERM)),
            _ => return Err(ClientError::errno("mknod", libc::EINVAL)),
        }
        self.link_target_dir("mknod", parent).await?;

        let mut spec = self.node_spec(parent, name, mode);
        spec.rdev = rdev;
        let inode = self.create_node(spec).await?;
        inode.file_attr()
    }

    pub async fn mkdir(&self, parent: Fid, name: &str, mode: u32) -> ClientResult<FileAttr> {
        self.check_mounted()?;
        check_name("mkdir", name)?;
        self.link_target_dir("mkdir", parent).await?;
        let mode = (mode & (0o777 | mode::S_ISVTX) & !self.config.credentials.umask) | mode::S_IFDIR;
        let inode = self.create_node(self.node_spec(parent, name, mode)).await?;
        inode.file_attr()
    }

    pub async fn symlink(&self, parent: Fid, name: &str, target: &str) -> ClientResult<FileAttr> {
        self.check_mounted()?;
        check_name("symlink", name)?;
        self.link_target_dir("symlink", parent).await?;
        let mut spec = self.node_spec(parent, name, mode::S_IFLNK | 0o777);
        spec.target = Some(target.to_string());
        let inode = self.create_node(spec).await?;
        // The creator already knows the target
        let _ = inode.symlink_cell().set(target.to_string());
        inode.file_attr()
    }

    /// Add a name for `fid` in `parent`.
    pub async fn link(&self, fid: Fid, parent: Fid, name: &str) -> ClientResult<FileAttr> {
        self.check_mounted()?;
        check_name("link", name)?;
        let inode = self.resolve(fid).await?;
        self.revalidate(&inode).await?;
        if inode.is_dir() {
            return Err(ClientError::errno("link", libc::EPERM));
        }
        self.check_link_ceiling("link", &inode)?;

        let body = self.mdc.link(fid, parent, name).await?;
        inode.merge(&body)?;
        self.invalidate_cached(parent);
        inode.file_attr()
    }

    pub async fn unlink(&self, parent: Fid, name: &str) -> ClientResult<()> {
        self.check_mounted()?;
        check_name("unlink", name)?;
        let removed = self.mdc.unlink(parent, name, 0).await?;
        self.invalidate_cached(parent);
        self.finish_removal(removed).await
    }

    pub async fn rmdir(&self, parent: Fid, name: &str) -> ClientResult<()> {
        self.check_mounted()?;
        check_name("rmdir", name)?;
        let removed = self.mdc.unlink(parent, name, mode::S_IFDIR).await?;
        self.invalidate_cached(parent);
        self.finish_removal(removed).await
    }

    /// Rename; an overwritten target loses its name like an unlink.
    pub async fn rename(&self, src_parent: Fid, src_name: &str, tgt_parent: Fid, tgt_name: &str) -> ClientResult<()> {
        self.check_mounted()?;
        check_name("rename", src_name)?;
        check_name("rename", tgt_name)?;
        let removed = self
            .mdc
            .rename(src_parent, src_name, tgt_parent, tgt_name)
            .await?;
        self.invalidate_cached(src_parent);
        self.invalidate_cached(tgt_parent);
        self.finish_removal(removed).await
    }

    /// Merge the body of an inode that lost a name, and destroy its storage
    /// objects if that was the last name.
    async fn finish_removal(&self, removed: Option<MdBody>) -> ClientResult<()> {
        let Some(body) = removed else {
            return Ok(());
        };
        let cached = body.attrs.fid.and_then(|fid| self.inodes.get(&fid));
        if let Some(inode) = &cached {
            inode.merge(&body)?;
        }

        let Some(blob) = &body.stripe else {
            return Ok(());
        };
        let fid = body
            .attrs
            .fid
            .ok_or_else(|| ClientError::Protocol("removed inode carries no fid".into()))?;
        let md = Arc::new(StripeMd::from_bytes(blob)?);
        if let Err(e) = self.lov.destroy(&md).await {
            self.stats.record_orphaned();
            error!(%fid, object = %md.object, error = %e, "Unlinked file left orphaned objects");
            return Err(ClientError::OrphanedObjects {
                fid,
                source: Box::new(e),
            });
        }
        debug!(%fid, stripes = md.stripe_count(), "Destroyed objects of unlinked file");
        Ok(())
    }

    pub async fn readlink(&self, fid: Fid) -> ClientResult<String> {
        self.check_mounted()?;
        let inode = self.resolve(fid).await?;
        self.revalidate(&inode).await?;
        if inode.file_type() != Some(FileType::Symlink) {
            return Err(ClientError::errno("readlink", libc::EINVAL));
        }
        self.symlink_target(&inode).await
    }

    pub async fn readdir(&self, fid: Fid) -> ClientResult<Vec<DirEntry>> {
        self.check_mounted()?;
        let inode = self.resolve(fid).await?;
        self.revalidate(&inode).await?;
        if !inode.is_dir() {
            return Err(ClientError::errno("readdir", libc::ENOTDIR));
        }
        self.mdc.readdir(fid).await
    }

    /// Open an existing inode and return a descriptor.
    #[instrument(level = "debug", skip(self), fields(%fid))]
    pub async fn open(&self, fid: Fid, flags: OpenFlags) -> ClientResult<u64> {
        self.check_mounted()?;
        let inode = self.resolve(fid).await?;
        self.revalidate(&inode).await?;
        self.open_inode(inode, flags).await
    }

    /// Open `name` in `parent`, creating it when `flags` asks for it.
    #[instrument(level = "debug", skip(self, flags), fields(%parent))]
    pub async fn open_at(&self, parent: Fid, name: &str, flags: OpenFlags, mode: u32) -> ClientResult<u64> {
        self.check_mounted()?;
        check_name("open", name)?;
        let inode = match self
            .mdc
            .lookup(parent, name, AttrValid::BASIC | AttrValid::EASIZE)
            .await
        {
            Ok(body) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                    return Err(ClientError::errno("open", libc::EEXIST));
                }
                let inode = self.inodes.iget(&body)?;
                self.revalidate(&inode).await?;
                inode
            }
            Err(e) if e.is_not_found() && flags.contains(OpenFlags::CREATE) => {
                self.link_target_dir("open", parent).await?;
                let mode = ((mode & mode::S_IALLUGO) & !self.config.credentials.umask) | mode::S_IFREG;
                let inode = self.create_node(self.node_spec(parent, name, mode)).await?;
                info!(%parent, name, fid = %inode.fid(), "Created");
                inode
            }
            Err(e) => return Err(e),
        };
        self.open_inode(inode, flags).await
    }

    async fn open_inode(&self, inode: Arc<Inode>, flags: OpenFlags) -> ClientResult<u64> {
        let writing = flags.contains(OpenFlags::WRITE);
        if inode.is_dir() && writing {
            return Err(ClientError::errno("open", libc::EISDIR));
        }
        if inode.file_type() == Some(FileType::Regular) && writing {
            if inode.stripe().is_none() {
                self.allocate_objects(&inode).await?;
            }
            if flags.contains(OpenFlags::TRUNC) {
                let attr = SetAttr::new().size(0).with_flags(SetAttrValid::FROM_OPEN);
                self.setattr_inode(&inode, attr).await?;
            }
        }
        let file = self.files.insert(inode, flags);
        Ok(file.fd())
    }

    /// Give a regular file its storage objects.
    ///
    /// Serialised per inode. If another client attached objects first, ours
    /// are destroyed and its layout is adopted.
    async fn allocate_objects(&self, inode: &Arc<Inode>) -> ClientResult<Arc<StripeMd>> {
        let _gate = inode.open_gate().lock().await;
        if let Some(md) = inode.stripe() {
            return Ok(md);
        }
        let fid = inode.fid();
        let spec = CreateSpec {
            group: 0,
            stripe_count: self.config.default_stripe_count,
            stripe_size: self.config.default_stripe_size,
        };
        let md = self.lov.create(&spec).await?;

        match self.mdc.set_stripe(fid, &md).await {
            Ok(body) => {
                inode.merge(&body)?;
                inode.set_stripe(Arc::clone(&md))?;
                debug!(%fid, object = %md.object, stripes = md.stripe_count(), "Allocated objects");
            }
            Err(e) => {
                if let Err(destroy) = self.lov.destroy(&md).await {
                    self.stats.record_orphaned();
                    warn!(%fid, error = %destroy, "Could not destroy unused objects");
                }
                if e.to_errno() != libc::EEXIST {
                    return Err(e);
                }
                let body = self
                    .mdc
                    .getattr_full(fid, AttrValid::BASIC | AttrValid::EASIZE)
                    .await?;
                inode.merge(&body)?;
            }
        }
        inode
            .stripe()
            .ok_or_else(|| ClientError::Protocol(format!("{fid}: no stripe metadata after allocation")))
    }

    pub async fn close(&self, fd: u64) -> ClientResult<()> {
        let file = self.files.remove(fd)?;
        if let Some(group) = file.take_group() {
            self.dt_locks.release(group.handle)?;
        }
        Ok(())
    }

    /// Read up to `len` bytes at `offset`, clipped to the file size.
    #[instrument(level = "trace", skip(self))]
    pub async fn read(&self, fd: u64, offset: u64, len: u64) -> ClientResult<Bytes> {
        self.check_mounted()?;
        let file = self.files.get(fd)?;
        if !file.flags().contains(OpenFlags::READ) {
            return Err(ClientError::BadDescriptor(fd));
        }
        let inode = file.inode();
        if inode.is_dir() {
            return Err(ClientError::errno("read", libc::EISDIR));
        }
        let Some(md) = inode.stripe() else {
            return Ok(Bytes::new());
        };

        let lock = if file.is_group_locked() {
            None
        } else {
            let handle = self
                .dt_locks
                .acquire(
                    data_resource(&md),
                    LockMode::Pr,
                    Policy::Extent(Extent::for_range(offset, len)),
                    LockFlags::empty(),
                    Some(inode.sink()),
                )
                .await?;
            Some(ScopedLock::new(self.dt_locks.clone(), handle))
        };

        self.glimpse(inode).await?;
        let size = inode.size();
        let data = if offset >= size || len == 0 {
            Bytes::new()
        } else {
            self.lov.read(&md, offset, len.min(size - offset)).await?
        };
        if let Some(lock) = lock {
            lock.release()?;
        }
        self.stats.record_read(data.len() as u64);
        Ok(data)
    }

    /// Write `data` at `offset` (or at end of file for append descriptors).
    /// Returns the bytes written.
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, fd: u64, offset: u64, data: Bytes) -> ClientResult<u64> {
        self.check_mounted()?;
        let file = self.files.get(fd)?;
        let flags = file.flags();
        if !flags.contains(OpenFlags::WRITE) {
            return Err(ClientError::BadDescriptor(fd));
        }
        let inode = file.inode();
        if inode.file_type() != Some(FileType::Regular) {
            return Err(ClientError::errno("write", libc::EINVAL));
        }
        let md = match inode.stripe() {
            Some(md) => md,
            None => self.allocate_objects(inode).await?,
        };
        let len = data.len() as u64;
        let append = flags.contains(OpenFlags::APPEND);

        let lock = if file.is_group_locked() {
            None
        } else {
            let extent = if append {
                Extent::to_eof(0)
            } else {
                Extent::for_range(offset, len)
            };
            let handle = self
                .dt_locks
                .acquire(
                    data_resource(&md),
                    LockMode::Pw,
                    Policy::Extent(extent),
                    LockFlags::empty(),
                    Some(inode.sink()),
                )
                .await?;
            Some(ScopedLock::new(self.dt_locks.clone(), handle))
        };

        let offset = if append {
            self.glimpse(inode).await?;
            inode.size()
        } else {
            offset
        };
        let limit = md.max_file_bytes().min(self.config.max_file_bytes);
        if offset.checked_add(len).is_none_or(|end| end > limit) {
            return Err(ClientError::errno("write", libc::EFBIG));
        }

        let written = if len == 0 {
            0
        } else {
            self.lov.write(&md, offset, data).await?
        };
        inode.extend_size(offset + written);
        if let Some(lock) = lock {
            lock.release()?;
        }
        self.stats.record_write(written);
        Ok(written)
    }

    /// Filesystem usage: metadata inode counts combined with the summed
    /// storage targets.
    pub async fn statfs(&self) -> ClientResult<ObdStatfs> {
        self.check_mounted()?;
        let max_age = self.config.statfs_max_age;
        if !max_age.is_zero() {
            if let Some((at, cached)) = *self.statfs_cache.lock() {
                if at.elapsed() < max_age {
                    return Ok(cached);
                }
            }
        }

        let md = self.mdc.statfs().await.inspect_err(|e| {
            error!(error = %e, "Metadata statfs failed");
        })?;
        let data = self.lov.statfs().await?;
        let merged = ObdStatfs::merge(&md, &data);
        *self.statfs_cache.lock() = Some((Instant::now(), merged));
        Ok(merged)
    }

    pub async fn statvfs(&self) -> ClientResult<StatVfs> {
        let osfs = self.statfs().await?;
        let (fsid, _) = self.id.as_u64_pair();
        Ok(StatVfs::from_obd(&osfs, fsid))
    }

    /// Group lock requests. A group-locked descriptor skips extent locking
    /// for its reads and writes.
    pub async fn ioctl(&self, fd: u64, request: Ioctl) -> ClientResult<()> {
        self.check_mounted()?;
        let file = self.files.get(fd)?;
        match request {
            Ioctl::GroupLock(gid) => {
                if file.is_group_locked() {
                    warn!(fd, held = ?file.group_gid(), "Group lock already held");
                    return Err(ClientError::errno("group lock", libc::EINVAL));
                }
                let inode = file.inode();
                let Some(md) = inode.stripe() else {
                    return Err(ClientError::errno("group lock", libc::EINVAL));
                };
                let flags = if file.flags().contains(OpenFlags::NONBLOCK) {
                    LockFlags::BLOCK_NOWAIT
                } else {
                    LockFlags::empty()
                };
                let handle = self
                    .dt_locks
                    .acquire(
                        data_resource(&md),
                        LockMode::Group,
                        Policy::Extent(Extent::group(gid)),
                        flags,
                        Some(inode.sink()),
                    )
                    .await?;
                if let Err(lost) = file.attach_group(GroupLock { gid, handle }) {
                    self.dt_locks.release(lost.handle)?;
                    return Err(ClientError::errno("group lock", libc::EINVAL));
                }
                debug!(fd, gid, "Group lock taken");
                Ok(())
            }
            Ioctl::GroupUnlock(gid) => {
                let Some(group) = file.detach_group(gid) else {
                    warn!(fd, gid, held = ?file.group_gid(), "No matching group lock");
                    return Err(ClientError::errno("group unlock", libc::EINVAL));
                };
                self.dt_locks.release(group.handle)?;
                debug!(fd, gid, "Group lock dropped");
                Ok(())
            }
        }
    }

    /// `F_GETFL` / `F_SETFL`. Only the append, non-blocking, async and
    /// direct flags can be changed, and non-blocking and async are refused.
    pub fn fcntl(&self, fd: u64, request: Fcntl) -> ClientResult<OpenFlags> {
        self.check_mounted()?;
        let file = self.files.get(fd)?;
        match request {
            Fcntl::GetFl => Ok(file.flags()),
            Fcntl::SetFl(flags) => {
                let settable = flags & OpenFlags::SETTABLE;
                if settable.intersects(UNSUPPORTED_SETFL) {
                    return Err(ClientError::errno("fcntl", libc::EINVAL));
                }
                let updated = (file.flags() - OpenFlags::SETTABLE) | settable;
                file.set_flags(updated);
                Ok(updated)
            }
        }
    }

    /// Writes are committed before they return, so there is nothing to flush.
    pub async fn sync(&self, fd: u64) -> ClientResult<()> {
        self.check_mounted()?;
        self.files.get(fd).map(|_| ())
    }

    pub async fn datasync(&self, fd: u64) -> ClientResult<()> {
        self.sync(fd).await
    }

    /// Drop `n` lookup references to `fid`.
    pub fn forget(&self, fid: Fid, n: u64) {
        self.inodes.forget(fid, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_name() {
        assert!(check_name("t", "file").is_ok());
        assert_eq!(check_name("t", "").unwrap_err().to_errno(), libc::EINVAL);
        assert_eq!(check_name("t", "a/b").unwrap_err().to_errno(), libc::EINVAL);
        assert_eq!(check_name("t", "..").unwrap_err().to_errno(), libc::EINVAL);
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(check_name("t", &long).unwrap_err().to_errno(), libc::ENAMETOOLONG);
        assert!(check_name("t", &"x".repeat(NAME_MAX)).is_ok());
    }

    #[test]
    fn test_unsupported_setfl() {
        assert!(OpenFlags::SETTABLE.contains(UNSUPPORTED_SETFL));
        assert!(!UNSUPPORTED_SETFL.contains(OpenFlags::DIRECT));
        assert!(!UNSUPPORTED_SETFL.contains(OpenFlags::APPEND));
    }
}
