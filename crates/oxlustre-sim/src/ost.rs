//! Simulated object storage target.
//!
//! Objects are flat byte vectors. Reads and writes are two-phase: `PrepRead`
//! returns the data, `PrepWrite` stages the data, and nothing written is
//! visible until `Commit`. Staged transfers are keyed by the client's token,
//! so a resent prep replaces its earlier entry.

use crate::error::{SimError, SimResult};
use crate::network::SimService;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use oxlustre_core::attr::now_secs;
use oxlustre_core::{AttrValid, ObdStatfs, ObjectId, Reply, Request, SetAttr, SetAttrValid, WireAttrs};
use oxlustre_dlm::{LockServer, ResourceId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument};

/// Bits of an object id reserved for the target index.
const TARGET_SHIFT: u32 = 40;

#[derive(Debug, Clone, Default)]
struct StoredObject {
    data: Vec<u8>,
    atime: i64,
    mtime: i64,
    ctime: i64,
}

#[derive(Debug, Clone)]
enum Staged {
    Read { object: ObjectId, len: u64 },
    Write { object: ObjectId, offset: u64, data: Bytes },
}

/// One punch as the target saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchRecord {
    pub object: ObjectId,
    pub start: u64,
    /// A data lock on the object's resource was granted when the punch ran.
    pub locked: bool,
}

#[derive(Debug)]
pub struct StorageTarget {
    name: String,
    index: u32,
    objects: DashMap<ObjectId, StoredObject>,
    staged: DashMap<u64, Staged>,
    next_object: AtomicU64,
    next_cookie: AtomicU64,
    capacity_blocks: u64,
    object_capacity: u64,
    block_size: u32,
    data_locks: LockServer,
    punches: Mutex<Vec<PunchRecord>>,
}

impl StorageTarget {
    pub fn new(
        name: impl Into<String>,
        index: u32,
        capacity_blocks: u64,
        object_capacity: u64,
        block_size: u32,
        data_locks: LockServer,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            objects: DashMap::new(),
            staged: DashMap::new(),
            next_object: AtomicU64::new(1),
            next_cookie: AtomicU64::new(1),
            capacity_blocks,
            object_capacity,
            block_size,
            data_locks,
            punches: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn has_object(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    /// Committed contents of an object.
    pub fn object_data(&self, object: ObjectId) -> Option<Vec<u8>> {
        self.objects.get(&object).map(|o| o.data.clone())
    }

    /// Transfers prepared but not yet committed.
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn punches(&self) -> Vec<PunchRecord> {
        self.punches.lock().clone()
    }

    fn used_blocks(&self) -> u64 {
        let bsize = u64::from(self.block_size.max(1));
        self.objects
            .iter()
            .map(|o| (o.data.len() as u64).div_ceil(bsize))
            .sum()
    }

    fn attrs(&self, stored: &StoredObject) -> WireAttrs {
        let size = stored.data.len() as u64;
        WireAttrs {
            valid: AttrValid::STORAGE | AttrValid::ATIME,
            size,
            blocks: size.div_ceil(512),
            blksize: self.block_size,
            atime: stored.atime,
            mtime: stored.mtime,
            ctime: stored.ctime,
            ..WireAttrs::default()
        }
    }

    fn create(&self) -> SimResult<ObjectId> {
        if self.objects.len() as u64 >= self.object_capacity {
            return Err(SimError::NoSpace);
        }
        let seq = self.next_object.fetch_add(1, Ordering::Relaxed);
        let object = ObjectId::new((u64::from(self.index) << TARGET_SHIFT) | seq, 0);
        let now = now_secs();
        self.objects.insert(
            object,
            StoredObject {
                data: Vec::new(),
                atime: now,
                mtime: now,
                ctime: now,
            },
        );
        debug!(target_name = %self.name, %object, "Object created");
        Ok(object)
    }

    fn setattr(&self, object: ObjectId, attr: &SetAttr) -> SimResult<WireAttrs> {
        let mut stored = self.objects.get_mut(&object).ok_or(SimError::NoObject(object))?;
        if attr.valid.contains(SetAttrValid::SIZE) {
            stored.data.resize(usize::try_from(attr.size).map_err(|_| SimError::NoSpace)?, 0);
        }
        if attr.valid.contains(SetAttrValid::ATIME) {
            stored.atime = attr.atime;
        }
        if attr.valid.contains(SetAttrValid::MTIME) {
            stored.mtime = attr.mtime;
        }
        if attr.valid.contains(SetAttrValid::CTIME) {
            stored.ctime = attr.ctime;
        }
        Ok(self.attrs(&stored))
    }

    fn punch(&self, object: ObjectId, start: u64, end: u64) -> SimResult<()> {
        let locked = self.data_locks.granted_count(ResourceId::from_object(object)) > 0;
        self.punches.lock().push(PunchRecord { object, start, locked });

        let mut stored = self.objects.get_mut(&object).ok_or(SimError::NoObject(object))?;
        let len = stored.data.len() as u64;
        if end == u64::MAX {
            let keep = usize::try_from(start).map_err(|_| SimError::NoSpace)?;
            stored.data.resize(keep, 0);
        } else if start < len {
            let from = start as usize;
            let to = end.saturating_add(1).min(len) as usize;
            stored.data[from..to].fill(0);
        }
        let now = now_secs();
        stored.mtime = now;
        stored.ctime = now;
        Ok(())
    }

    fn prep_read(&self, token: u64, object: ObjectId, offset: u64, len: u64) -> SimResult<Bytes> {
        let stored = self.objects.get(&object).ok_or(SimError::NoObject(object))?;
        let size = stored.data.len() as u64;
        let data = if offset >= size {
            Bytes::new()
        } else {
            let end = offset.saturating_add(len).min(size);
            Bytes::copy_from_slice(&stored.data[offset as usize..end as usize])
        };
        drop(stored);
        self.staged.insert(token, Staged::Read { object, len: data.len() as u64 });
        Ok(data)
    }

    fn prep_write(&self, token: u64, object: ObjectId, offset: u64, data: Bytes) -> SimResult<()> {
        if !self.objects.contains_key(&object) {
            return Err(SimError::NoObject(object));
        }
        let needed = (data.len() as u64).div_ceil(u64::from(self.block_size.max(1)));
        if self.used_blocks() + needed > self.capacity_blocks {
            return Err(SimError::NoSpace);
        }
        self.staged.insert(token, Staged::Write { object, offset, data });
        Ok(())
    }

    fn commit(&self, token: u64) -> SimResult<u64> {
        let (_, staged) = self
            .staged
            .remove(&token)
            .ok_or_else(|| SimError::Invalid(format!("unknown token {token}")))?;
        match staged {
            Staged::Read { object, len } => {
                if let Some(mut stored) = self.objects.get_mut(&object) {
                    stored.atime = now_secs();
                }
                Ok(len)
            }
            Staged::Write { object, offset, data } => {
                let mut stored = self.objects.get_mut(&object).ok_or(SimError::NoObject(object))?;
                let start = usize::try_from(offset).map_err(|_| SimError::NoSpace)?;
                let end = start + data.len();
                if stored.data.len() < end {
                    stored.data.resize(end, 0);
                }
                stored.data[start..end].copy_from_slice(&data);
                let now = now_secs();
                stored.mtime = now;
                stored.ctime = now;
                Ok(data.len() as u64)
            }
        }
    }

    fn statfs(&self) -> ObdStatfs {
        let used = self.used_blocks();
        let objects = self.objects.len() as u64;
        ObdStatfs {
            blocks: self.capacity_blocks,
            bfree: self.capacity_blocks.saturating_sub(used),
            bavail: self.capacity_blocks.saturating_sub(used),
            files: self.object_capacity,
            ffree: self.object_capacity.saturating_sub(objects),
            bsize: self.block_size,
            namelen: 255,
        }
    }

    fn execute(&self, request: Request) -> SimResult<Reply> {
        match request {
            Request::Connect { client } => {
                debug!(target_name = %self.name, %client, "Client connected");
                Ok(Reply::Connected {
                    cookie: self.next_cookie.fetch_add(1, Ordering::Relaxed),
                })
            }
            Request::Disconnect { .. } => Ok(Reply::Done),
            Request::Statfs => Ok(Reply::Statfs(self.statfs())),
            Request::ObjCreate { .. } => Ok(Reply::Object {
                object: self.create()?,
                attrs: WireAttrs::default(),
            }),
            Request::ObjDestroy { object } => {
                self.objects.remove(&object).ok_or(SimError::NoObject(object))?;
                self.staged.retain(|_, staged| match staged {
                    Staged::Read { object: o, .. } | Staged::Write { object: o, .. } => *o != object,
                });
                debug!(target_name = %self.name, %object, "Object destroyed");
                Ok(Reply::Done)
            }
            Request::ObjGetattr { object, valid } => {
                let stored = self.objects.get(&object).ok_or(SimError::NoObject(object))?;
                Ok(Reply::Object {
                    object,
                    attrs: self.attrs(&stored).project(valid),
                })
            }
            Request::ObjSetattr { object, attr } => Ok(Reply::Object {
                object,
                attrs: self.setattr(object, &attr)?,
            }),
            Request::ObjPunch { object, start, end } => {
                self.punch(object, start, end)?;
                Ok(Reply::Done)
            }
            Request::PrepRead {
                token,
                object,
                offset,
                len,
            } => Ok(Reply::Prepared {
                token,
                data: self.prep_read(token, object, offset, len)?,
            }),
            Request::PrepWrite {
                token,
                object,
                offset,
                data,
            } => {
                self.prep_write(token, object, offset, data)?;
                Ok(Reply::Prepared {
                    token,
                    data: Bytes::new(),
                })
            }
            Request::Commit { token } => Ok(Reply::Committed {
                bytes: self.commit(token)?,
            }),
            other => Err(SimError::Invalid(format!(
                "{:?} sent to a storage target",
                other.opcode()
            ))),
        }
    }
}

#[async_trait]
impl SimService for StorageTarget {
    #[instrument(level = "trace", skip_all, fields(target_name = %self.name, op = ?request.opcode()))]
    async fn handle(&self, request: Request) -> Reply {
        self.execute(request).unwrap_or_else(|e| {
            debug!(target_name = %self.name, error = %e, "Request failed");
            Reply::Error { errno: e.to_errno() }
        })
    }
}
