//! Storage behind the simulated metadata server.
//!
//! [`BackingStore`] is what the metadata server needs from a local
//! filesystem: inodes, directory entries, the stripe metadata EA and
//! transaction brackets around every change. [`MemoryStore`] keeps all of
//! it in memory.

use crate::error::{SimError, SimResult};
use bytes::Bytes;
use oxlustre_core::{AttrValid, DirEntry, Fid, FileType, ObdStatfs, WireAttrs};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Directory entries returned per `read_page`.
pub const DIR_PAGE_ENTRIES: usize = 64;

/// What a transaction is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOp {
    Create,
    Setattr,
    SetStripe,
    Link,
    Unlink,
    Rename,
}

/// An open transaction. Every mutation names the transaction it belongs to.
#[derive(Debug, PartialEq, Eq)]
pub struct Transaction {
    pub id: u64,
    pub op: TxnOp,
}

pub trait BackingStore: Send + Sync {
    fn start_transaction(&self, op: TxnOp) -> SimResult<Transaction>;

    /// Close a transaction. Returns its transaction number.
    fn commit_transaction(&self, txn: Transaction) -> SimResult<u64>;

    fn get_inode(&self, fid: Fid) -> SimResult<WireAttrs>;

    fn put_inode(&self, txn: &Transaction, attrs: WireAttrs) -> SimResult<()>;

    /// Remove an inode together with its EA and symlink target.
    fn remove_inode(&self, txn: &Transaction, fid: Fid) -> SimResult<()>;

    fn lookup(&self, dir: Fid, name: &str) -> SimResult<Option<Fid>>;

    fn insert_entry(&self, txn: &Transaction, dir: Fid, name: &str, fid: Fid, kind: FileType) -> SimResult<()>;

    fn remove_entry(&self, txn: &Transaction, dir: Fid, name: &str) -> SimResult<Fid>;

    fn entry_count(&self, dir: Fid) -> SimResult<usize>;

    /// Stripe metadata blob of an inode.
    fn get_ea(&self, fid: Fid) -> SimResult<Option<Bytes>>;

    fn set_ea(&self, txn: &Transaction, fid: Fid, ea: Bytes) -> SimResult<()>;

    fn get_symlink(&self, fid: Fid) -> SimResult<Option<String>>;

    fn set_symlink(&self, txn: &Transaction, fid: Fid, target: &str) -> SimResult<()>;

    /// One page of directory entries in name order. The flag is true on the
    /// last page.
    fn read_page(&self, dir: Fid, page: u64) -> SimResult<(Vec<DirEntry>, bool)>;

    fn statfs(&self) -> ObdStatfs;

    /// Allocate an unused fid.
    fn next_fid(&self) -> Fid;
}

#[derive(Debug, Default)]
struct Tables {
    inodes: HashMap<Fid, WireAttrs>,
    dirs: HashMap<Fid, BTreeMap<String, (Fid, FileType)>>,
    eas: HashMap<Fid, Bytes>,
    symlinks: HashMap<Fid, String>,
    open: Vec<u64>,
}

impl Tables {
    fn check_open(&self, txn: &Transaction) -> SimResult<()> {
        if self.open.contains(&txn.id) {
            Ok(())
        } else {
            Err(SimError::NoTransaction)
        }
    }

    fn dir(&self, dir: Fid) -> SimResult<&BTreeMap<String, (Fid, FileType)>> {
        if !self.inodes.contains_key(&dir) {
            return Err(SimError::NoInode(dir));
        }
        self.dirs.get(&dir).ok_or(SimError::NotDir(dir))
    }
}

/// In-memory [`BackingStore`].
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    next_txn: AtomicU64,
    last_committed: AtomicU64,
    next_id: AtomicU64,
    inode_capacity: u64,
    block_size: u32,
}

impl MemoryStore {
    /// Create a store holding only the root directory `root`.
    pub fn new(root: Fid, inode_capacity: u64, block_size: u32) -> Self {
        let now = oxlustre_core::attr::now_secs();
        let root_attrs = WireAttrs {
            valid: AttrValid::BASIC,
            fid: Some(root),
            mode: oxlustre_core::attr::mode::S_IFDIR | 0o755,
            nlink: 2,
            size: u64::from(block_size),
            blksize: block_size,
            atime: now,
            mtime: now,
            ctime: now,
            ..WireAttrs::default()
        };
        let mut tables = Tables::default();
        tables.inodes.insert(root, root_attrs);
        tables.dirs.insert(root, BTreeMap::new());
        Self {
            tables: Mutex::new(tables),
            next_txn: AtomicU64::new(1),
            last_committed: AtomicU64::new(0),
            next_id: AtomicU64::new(root.id + 1),
            inode_capacity,
            block_size,
        }
    }

    /// Number of the last committed transaction.
    pub fn last_committed(&self) -> u64 {
        self.last_committed.load(Ordering::Acquire)
    }

    pub fn inode_count(&self) -> usize {
        self.tables.lock().inodes.len()
    }
}

impl BackingStore for MemoryStore {
    fn start_transaction(&self, op: TxnOp) -> SimResult<Transaction> {
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        self.tables.lock().open.push(id);
        Ok(Transaction { id, op })
    }

    fn commit_transaction(&self, txn: Transaction) -> SimResult<u64> {
        let mut tables = self.tables.lock();
        let pos = tables
            .open
            .iter()
            .position(|id| *id == txn.id)
            .ok_or(SimError::NoTransaction)?;
        tables.open.swap_remove(pos);
        self.last_committed.fetch_max(txn.id, Ordering::AcqRel);
        Ok(txn.id)
    }

    fn get_inode(&self, fid: Fid) -> SimResult<WireAttrs> {
        self.tables
            .lock()
            .inodes
            .get(&fid)
            .copied()
            .ok_or(SimError::NoInode(fid))
    }

    fn put_inode(&self, txn: &Transaction, attrs: WireAttrs) -> SimResult<()> {
        let fid = attrs
            .fid
            .ok_or_else(|| SimError::Invalid("inode without fid".into()))?;
        let mut tables = self.tables.lock();
        tables.check_open(txn)?;
        if !tables.inodes.contains_key(&fid) {
            if tables.inodes.len() as u64 >= self.inode_capacity {
                return Err(SimError::NoSpace);
            }
            if attrs.file_type() == Some(FileType::Directory) {
                tables.dirs.entry(fid).or_default();
            }
        }
        tables.inodes.insert(fid, attrs);
        Ok(())
    }

    fn remove_inode(&self, txn: &Transaction, fid: Fid) -> SimResult<()> {
        let mut tables = self.tables.lock();
        tables.check_open(txn)?;
        tables.inodes.remove(&fid).ok_or(SimError::NoInode(fid))?;
        tables.dirs.remove(&fid);
        tables.eas.remove(&fid);
        tables.symlinks.remove(&fid);
        Ok(())
    }

    fn lookup(&self, dir: Fid, name: &str) -> SimResult<Option<Fid>> {
        let tables = self.tables.lock();
        Ok(tables.dir(dir)?.get(name).map(|(fid, _)| *fid))
    }

    fn insert_entry(&self, txn: &Transaction, dir: Fid, name: &str, fid: Fid, kind: FileType) -> SimResult<()> {
        let mut tables = self.tables.lock();
        tables.check_open(txn)?;
        tables.dir(dir)?;
        let entries = tables.dirs.entry(dir).or_default();
        if entries.contains_key(name) {
            return Err(SimError::Exists {
                dir,
                name: name.to_string(),
            });
        }
        entries.insert(name.to_string(), (fid, kind));
        Ok(())
    }

    fn remove_entry(&self, txn: &Transaction, dir: Fid, name: &str) -> SimResult<Fid> {
        let mut tables = self.tables.lock();
        tables.check_open(txn)?;
        tables.dir(dir)?;
        tables
            .dirs
            .get_mut(&dir)
            .and_then(|entries| entries.remove(name))
            .map(|(fid, _)| fid)
            .ok_or_else(|| SimError::NoEntry {
                dir,
                name: name.to_string(),
            })
    }

    fn entry_count(&self, dir: Fid) -> SimResult<usize> {
        Ok(self.tables.lock().dir(dir)?.len())
    }

    fn get_ea(&self, fid: Fid) -> SimResult<Option<Bytes>> {
        let tables = self.tables.lock();
        if !tables.inodes.contains_key(&fid) {
            return Err(SimError::NoInode(fid));
        }
        Ok(tables.eas.get(&fid).cloned())
    }

    fn set_ea(&self, txn: &Transaction, fid: Fid, ea: Bytes) -> SimResult<()> {
        let mut tables = self.tables.lock();
        tables.check_open(txn)?;
        let attrs = tables.inodes.get_mut(&fid).ok_or(SimError::NoInode(fid))?;
        attrs.easize = ea.len() as u32;
        attrs.valid |= AttrValid::EASIZE;
        tables.eas.insert(fid, ea);
        Ok(())
    }

    fn get_symlink(&self, fid: Fid) -> SimResult<Option<String>> {
        let tables = self.tables.lock();
        if !tables.inodes.contains_key(&fid) {
            return Err(SimError::NoInode(fid));
        }
        Ok(tables.symlinks.get(&fid).cloned())
    }

    fn set_symlink(&self, txn: &Transaction, fid: Fid, target: &str) -> SimResult<()> {
        let mut tables = self.tables.lock();
        tables.check_open(txn)?;
        if !tables.inodes.contains_key(&fid) {
            return Err(SimError::NoInode(fid));
        }
        tables.symlinks.insert(fid, target.to_string());
        Ok(())
    }

    fn read_page(&self, dir: Fid, page: u64) -> SimResult<(Vec<DirEntry>, bool)> {
        let tables = self.tables.lock();
        let entries = tables.dir(dir)?;
        let skip = usize::try_from(page)
            .map_err(|_| SimError::Invalid(format!("page {page}")))?
            .saturating_mul(DIR_PAGE_ENTRIES);
        let out: Vec<DirEntry> = entries
            .iter()
            .skip(skip)
            .take(DIR_PAGE_ENTRIES)
            .map(|(name, (fid, kind))| DirEntry {
                name: name.clone(),
                fid: *fid,
                kind: *kind,
            })
            .collect();
        let last = skip + out.len() >= entries.len();
        Ok((out, last))
    }

    fn statfs(&self) -> ObdStatfs {
        let used = self.tables.lock().inodes.len() as u64;
        ObdStatfs {
            blocks: self.inode_capacity,
            bfree: self.inode_capacity.saturating_sub(used),
            bavail: self.inode_capacity.saturating_sub(used),
            files: self.inode_capacity,
            ffree: self.inode_capacity.saturating_sub(used),
            bsize: self.block_size,
            namelen: 255,
        }
    }

    fn next_fid(&self) -> Fid {
        Fid::new(self.next_id.fetch_add(1, Ordering::Relaxed), 1, 0)
    }
}
