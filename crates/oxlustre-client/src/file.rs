//! Open-file table.
//!
//! Descriptors are plain `u64` ids handed out from 1 upward (0 is never a
//! valid descriptor). Each open file remembers its flags and, while held,
//! the group lock taken through it.

use crate::error::{ClientError, ClientResult};
use crate::inode::Inode;
use bitflags::bitflags;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use oxlustre_dlm::LockHandle;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Open flags of a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const CREATE   = 1 << 2;
        const EXCL     = 1 << 3;
        const TRUNC    = 1 << 4;
        const APPEND   = 1 << 5;
        const NONBLOCK = 1 << 6;
        const ASYNC    = 1 << 7;
        const DIRECT   = 1 << 8;

        const RDWR = Self::READ.bits() | Self::WRITE.bits();
        /// Flags `fcntl(F_SETFL)` may change.
        const SETTABLE = Self::APPEND.bits() | Self::NONBLOCK.bits()
            | Self::ASYNC.bits() | Self::DIRECT.bits();
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ
    }
}

/// A group lock held through a descriptor.
#[derive(Debug)]
pub struct GroupLock {
    pub gid: u64,
    pub handle: LockHandle,
}

#[derive(Debug)]
pub struct OpenFile {
    fd: u64,
    inode: Arc<Inode>,
    flags: Mutex<OpenFlags>,
    group: Mutex<Option<GroupLock>>,
}

impl OpenFile {
    pub fn fd(&self) -> u64 {
        self.fd
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn flags(&self) -> OpenFlags {
        *self.flags.lock()
    }

    pub(crate) fn set_flags(&self, flags: OpenFlags) {
        *self.flags.lock() = flags;
    }

    pub fn is_group_locked(&self) -> bool {
        self.group.lock().is_some()
    }

    pub fn group_gid(&self) -> Option<u64> {
        self.group.lock().as_ref().map(|g| g.gid)
    }

    /// Record a freshly granted group lock. Hands the lock back if one is
    /// already held.
    pub(crate) fn attach_group(&self, lock: GroupLock) -> Result<(), GroupLock> {
        let mut slot = self.group.lock();
        if slot.is_some() {
            return Err(lock);
        }
        *slot = Some(lock);
        Ok(())
    }

    /// Take the group lock if it was taken with `gid`.
    pub(crate) fn detach_group(&self, gid: u64) -> Option<GroupLock> {
        let mut slot = self.group.lock();
        match slot.as_ref() {
            Some(held) if held.gid == gid => slot.take(),
            _ => None,
        }
    }

    pub(crate) fn take_group(&self) -> Option<GroupLock> {
        self.group.lock().take()
    }
}

/// Descriptor table of a session.
#[derive(Debug)]
pub struct FileTable {
    files: DashMap<u64, Arc<OpenFile>>,
    next_fd: AtomicU64,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            next_fd: AtomicU64::new(1),
        }
    }

    /// Register an open file and return its descriptor.
    pub fn insert(&self, inode: Arc<Inode>, flags: OpenFlags) -> Arc<OpenFile> {
        loop {
            let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
            if fd == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.files.entry(fd) {
                let file = Arc::new(OpenFile {
                    fd,
                    inode: Arc::clone(&inode),
                    flags: Mutex::new(flags),
                    group: Mutex::new(None),
                });
                entry.insert(Arc::clone(&file));
                return file;
            }
        }
    }

    pub fn get(&self, fd: u64) -> ClientResult<Arc<OpenFile>> {
        self.files
            .get(&fd)
            .map(|f| Arc::clone(f.value()))
            .ok_or(ClientError::BadDescriptor(fd))
    }

    pub fn remove(&self, fd: u64) -> ClientResult<Arc<OpenFile>> {
        self.files
            .remove(&fd)
            .map(|(_, f)| f)
            .ok_or(ClientError::BadDescriptor(fd))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Remove every descriptor (used at unmount).
    pub fn drain(&self) -> Vec<Arc<OpenFile>> {
        let fds: Vec<u64> = self.files.iter().map(|e| *e.key()).collect();
        fds.into_iter()
            .filter_map(|fd| self.files.remove(&fd).map(|(_, f)| f))
            .collect()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settable_flags() {
        assert!(OpenFlags::SETTABLE.contains(OpenFlags::APPEND));
        assert!(!OpenFlags::SETTABLE.contains(OpenFlags::WRITE));
        assert_eq!(OpenFlags::RDWR, OpenFlags::READ | OpenFlags::WRITE);
    }
}
