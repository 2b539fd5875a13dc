//! Simulated metadata server.
//!
//! Namespace changes are serialised and each one runs under EX inode-bits
//! locks on every inode it modifies, taken from the metadata lock namespace
//! like any other client would. That is what revokes the PR locks clients
//! cache attributes under.

use crate::backing::{BackingStore, Transaction, TxnOp};
use crate::error::{SimError, SimResult};
use crate::network::SimService;
use async_trait::async_trait;
use bytes::Bytes;
use oxlustre_core::attr::{mode, now_secs};
use oxlustre_core::{AttrValid, Fid, FileType, MdBody, Reply, Request, SetAttr, SetAttrValid, StripeMd, WireAttrs};
use oxlustre_dlm::{InodeBits, LockClient, LockFlags, LockHandle, LockMode, Policy, ResourceId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument, warn};

/// Attributes always returned, whatever the request asked for.
const IDENTITY: AttrValid = AttrValid::ID
    .union(AttrValid::GENERATION)
    .union(AttrValid::TYPE);

/// Validity bits of the attribute block a create or lookup returns.
const CREATE_REPLY: AttrValid = AttrValid::BASIC.union(AttrValid::EASIZE);

fn kind_of(attrs: &WireAttrs) -> SimResult<FileType> {
    FileType::from_mode(attrs.mode)
        .ok_or_else(|| SimError::Invalid(format!("bad mode {:o}", attrs.mode)))
}

pub struct MetadataServer {
    name: String,
    root: Fid,
    store: Arc<dyn BackingStore>,
    locks: LockClient,
    namespace: tokio::sync::Mutex<()>,
    next_cookie: AtomicU64,
    block_size: u32,
}

impl std::fmt::Debug for MetadataServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataServer")
            .field("name", &self.name)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl MetadataServer {
    /// `locks` should be connected with an LRU size of zero so every lock
    /// is cancelled as soon as the change it protected is done.
    pub fn new(name: impl Into<String>, root: Fid, store: Arc<dyn BackingStore>, locks: LockClient, block_size: u32) -> Self {
        Self {
            name: name.into(),
            root,
            store,
            locks,
            namespace: tokio::sync::Mutex::new(()),
            next_cookie: AtomicU64::new(1),
            block_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> Fid {
        self.root
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Overwrite the stripe metadata of an inode behind every client's back.
    pub fn replace_stripe(&self, fid: Fid, blob: Bytes) -> SimResult<()> {
        self.in_txn(TxnOp::SetStripe, |txn| self.store.set_ea(txn, fid, blob))
    }

    fn in_txn<T>(&self, op: TxnOp, f: impl FnOnce(&Transaction) -> SimResult<T>) -> SimResult<T> {
        let txn = self.store.start_transaction(op)?;
        let result = f(&txn);
        let committed = self.store.commit_transaction(txn);
        let value = result?;
        committed?;
        Ok(value)
    }

    async fn lock_ex(&self, fids: &[Fid], held: &mut Vec<LockHandle>) -> SimResult<()> {
        let mut resources: Vec<ResourceId> = fids.iter().map(|f| ResourceId::from_fid(*f)).collect();
        resources.sort_unstable();
        resources.dedup();
        let policy = Policy::InodeBits(InodeBits::UPDATE | InodeBits::LOOKUP);
        for resource in resources {
            if held.iter().any(|h| h.resource() == resource) {
                continue;
            }
            let handle = self
                .locks
                .acquire(resource, LockMode::Ex, policy, LockFlags::empty(), None)
                .await?;
            held.push(handle);
        }
        Ok(())
    }

    fn unlock(&self, held: Vec<LockHandle>) {
        for handle in held {
            let resource = handle.resource();
            if let Err(e) = self.locks.release(handle) {
                warn!(mds = %self.name, %resource, error = %e, "Server lock release failed");
            }
        }
    }

    fn make_body(&self, attrs: WireAttrs, ea: Option<Bytes>, valid: AttrValid) -> MdBody {
        let mut valid = valid | IDENTITY;
        if ea.is_some() {
            // Size of a striped file lives on its objects
            valid.remove(AttrValid::SIZE | AttrValid::BLOCKS);
        }
        let mut attrs = attrs.project(valid);
        let stripe = if valid.contains(AttrValid::EASIZE) { ea } else { None };
        if stripe.is_none() {
            attrs.valid.remove(AttrValid::EASIZE);
        }
        MdBody {
            attrs,
            stripe,
            linkname: None,
        }
    }

    fn body(&self, fid: Fid, valid: AttrValid) -> SimResult<MdBody> {
        let attrs = self.store.get_inode(fid)?;
        let mut body = self.make_body(attrs, self.store.get_ea(fid)?, valid);
        if valid.contains(AttrValid::LINKNAME) {
            if let Some(target) = self.store.get_symlink(fid)? {
                body.linkname = Some(target);
                body.attrs.valid |= AttrValid::LINKNAME;
            }
        }
        Ok(body)
    }

    fn dir_attrs(&self, dir: Fid) -> SimResult<WireAttrs> {
        let attrs = self.store.get_inode(dir)?;
        if kind_of(&attrs)? != FileType::Directory {
            return Err(SimError::NotDir(dir));
        }
        Ok(attrs)
    }

    /// Bump a directory's times and adjust its link count.
    fn touch_dir(&self, txn: &Transaction, dir: Fid, nlink_delta: i32, now: i64) -> SimResult<()> {
        let mut attrs = self.dir_attrs(dir)?;
        attrs.nlink = attrs.nlink.saturating_add_signed(nlink_delta);
        attrs.mtime = now;
        attrs.ctime = now;
        self.store.put_inode(txn, attrs)
    }

    /// Drop one name of `fid`. Returns the body clients get back: with the
    /// stripe blob when that was the last link.
    fn drop_link(&self, txn: &Transaction, fid: Fid, now: i64) -> SimResult<MdBody> {
        let mut attrs = self.store.get_inode(fid)?;
        if kind_of(&attrs)? == FileType::Directory {
            attrs.nlink = 0;
        } else {
            attrs.nlink = attrs.nlink.saturating_sub(1);
        }
        attrs.ctime = now;
        if attrs.nlink == 0 {
            let ea = self.store.get_ea(fid)?;
            let body = self.make_body(attrs, ea, AttrValid::BASIC | AttrValid::EASIZE);
            self.store.remove_inode(txn, fid)?;
            debug!(mds = %self.name, %fid, "Inode removed");
            Ok(body)
        } else {
            self.store.put_inode(txn, attrs)?;
            Ok(self.make_body(attrs, None, AttrValid::BASIC))
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        parent: Fid,
        name: String,
        mode_bits: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        target: Option<String>,
        stripe: Option<Bytes>,
    ) -> SimResult<MdBody> {
        let kind = FileType::from_mode(mode_bits)
            .ok_or_else(|| SimError::Invalid(format!("bad mode {mode_bits:o}")))?;
        if kind == FileType::Symlink && target.is_none() {
            return Err(SimError::Invalid("symlink without target".into()));
        }
        if stripe.is_some() && kind != FileType::Regular {
            return Err(SimError::Invalid("stripe metadata on a non-regular file".into()));
        }
        if let Some(blob) = &stripe {
            StripeMd::from_bytes(blob)?;
        }

        let _ns = self.namespace.lock().await;
        let mut held = Vec::new();
        self.lock_ex(&[parent], &mut held).await?;
        let result = self.in_txn(TxnOp::Create, |txn| {
            self.dir_attrs(parent)?;
            if self.store.lookup(parent, &name)?.is_some() {
                return Err(SimError::Exists { dir: parent, name: name.clone() });
            }
            let fid = self.store.next_fid();
            let now = now_secs();
            let size = match (kind, &target) {
                (FileType::Symlink, Some(t)) => t.len() as u64,
                (FileType::Directory, _) => u64::from(self.block_size),
                _ => 0,
            };
            let attrs = WireAttrs {
                valid: AttrValid::BASIC,
                fid: Some(fid),
                mode: mode_bits,
                uid,
                gid,
                size,
                blksize: self.block_size,
                nlink: if kind == FileType::Directory { 2 } else { 1 },
                atime: now,
                mtime: now,
                ctime: now,
                rdev,
                ..WireAttrs::default()
            };
            self.store.put_inode(txn, attrs)?;
            self.store.insert_entry(txn, parent, &name, fid, kind)?;
            if let Some(t) = &target {
                self.store.set_symlink(txn, fid, t)?;
            }
            if let Some(blob) = stripe {
                self.store.set_ea(txn, fid, blob)?;
            }
            let delta = i32::from(kind == FileType::Directory);
            self.touch_dir(txn, parent, delta, now)?;
            debug!(mds = %self.name, %parent, %name, %fid, ?kind, "Created");
            Ok(fid)
        });
        self.unlock(held);
        self.body(result?, CREATE_REPLY)
    }

    async fn setattr(&self, fid: Fid, attr: SetAttr) -> SimResult<MdBody> {
        let _ns = self.namespace.lock().await;
        let mut held = Vec::new();
        self.lock_ex(&[fid], &mut held).await?;
        let result = self.in_txn(TxnOp::Setattr, |txn| {
            let mut attrs = self.store.get_inode(fid)?;
            if attr.valid.contains(SetAttrValid::SIZE) && kind_of(&attrs)? == FileType::Directory {
                return Err(SimError::IsDir(fid));
            }
            attrs.apply(&attr);
            if !attr.valid.contains(SetAttrValid::CTIME) {
                attrs.ctime = attrs.ctime.max(now_secs());
            }
            self.store.put_inode(txn, attrs)
        });
        self.unlock(held);
        result?;
        self.body(fid, AttrValid::BASIC)
    }

    async fn set_stripe(&self, fid: Fid, blob: Bytes) -> SimResult<MdBody> {
        StripeMd::from_bytes(&blob)?;
        let _ns = self.namespace.lock().await;
        let mut held = Vec::new();
        self.lock_ex(&[fid], &mut held).await?;
        let result = self.in_txn(TxnOp::SetStripe, |txn| {
            let attrs = self.store.get_inode(fid)?;
            if kind_of(&attrs)? != FileType::Regular {
                return Err(SimError::Invalid(format!("{fid} is not a regular file")));
            }
            if self.store.get_ea(fid)?.is_some() {
                return Err(SimError::StripeExists(fid));
            }
            self.store.set_ea(txn, fid, blob)
        });
        self.unlock(held);
        result?;
        self.body(fid, CREATE_REPLY)
    }

    async fn link(&self, fid: Fid, parent: Fid, name: String) -> SimResult<MdBody> {
        let _ns = self.namespace.lock().await;
        let mut held = Vec::new();
        self.lock_ex(&[fid, parent], &mut held).await?;
        let result = self.in_txn(TxnOp::Link, |txn| {
            let mut attrs = self.store.get_inode(fid)?;
            let kind = kind_of(&attrs)?;
            if kind == FileType::Directory {
                return Err(SimError::NotPermitted(format!("hard link to directory {fid}")));
            }
            self.dir_attrs(parent)?;
            if self.store.lookup(parent, &name)?.is_some() {
                return Err(SimError::Exists { dir: parent, name: name.clone() });
            }
            let now = now_secs();
            self.store.insert_entry(txn, parent, &name, fid, kind)?;
            attrs.nlink += 1;
            attrs.ctime = now;
            self.store.put_inode(txn, attrs)?;
            self.touch_dir(txn, parent, 0, now)
        });
        self.unlock(held);
        result?;
        self.body(fid, AttrValid::BASIC)
    }

    async fn unlink(&self, parent: Fid, name: String, kind: u32) -> SimResult<Option<MdBody>> {
        let _ns = self.namespace.lock().await;
        let mut held = Vec::new();
        let result: SimResult<MdBody> = async {
            self.lock_ex(&[parent], &mut held).await?;
            self.dir_attrs(parent)?;
            let child = self
                .store
                .lookup(parent, &name)?
                .ok_or_else(|| SimError::NoEntry { dir: parent, name: name.clone() })?;
            self.lock_ex(&[child], &mut held).await?;

            self.in_txn(TxnOp::Unlink, |txn| {
                let is_dir = kind_of(&self.store.get_inode(child)?)? == FileType::Directory;
                if kind == mode::S_IFDIR && !is_dir {
                    return Err(SimError::NotDir(child));
                }
                if kind != mode::S_IFDIR && is_dir {
                    return Err(SimError::IsDir(child));
                }
                if is_dir && self.store.entry_count(child)? > 0 {
                    return Err(SimError::NotEmpty(child));
                }
                let now = now_secs();
                self.store.remove_entry(txn, parent, &name)?;
                self.touch_dir(txn, parent, -i32::from(is_dir), now)?;
                self.drop_link(txn, child, now)
            })
        }
        .await;
        self.unlock(held);
        result.map(Some)
    }

    async fn rename(&self, src_parent: Fid, src_name: String, tgt_parent: Fid, tgt_name: String) -> SimResult<Option<MdBody>> {
        let _ns = self.namespace.lock().await;
        let mut held = Vec::new();
        let result: SimResult<Option<MdBody>> = async {
            self.lock_ex(&[src_parent, tgt_parent], &mut held).await?;
            self.dir_attrs(src_parent)?;
            self.dir_attrs(tgt_parent)?;
            let source = self
                .store
                .lookup(src_parent, &src_name)?
                .ok_or_else(|| SimError::NoEntry { dir: src_parent, name: src_name.clone() })?;
            let victim = self.store.lookup(tgt_parent, &tgt_name)?;
            if victim == Some(source) {
                return Ok(None);
            }
            if source == tgt_parent {
                return Err(SimError::Invalid(format!("cannot move {source} into itself")));
            }
            let mut fids = vec![source];
            fids.extend(victim);
            self.lock_ex(&fids, &mut held).await?;

            self.in_txn(TxnOp::Rename, |txn| {
                let mut src_attrs = self.store.get_inode(source)?;
                let src_kind = kind_of(&src_attrs)?;
                let src_is_dir = src_kind == FileType::Directory;
                let now = now_secs();

                let removed = match victim {
                    Some(victim) => {
                        let victim_is_dir = kind_of(&self.store.get_inode(victim)?)? == FileType::Directory;
                        if src_is_dir && !victim_is_dir {
                            return Err(SimError::NotDir(victim));
                        }
                        if !src_is_dir && victim_is_dir {
                            return Err(SimError::IsDir(victim));
                        }
                        if victim_is_dir && self.store.entry_count(victim)? > 0 {
                            return Err(SimError::NotEmpty(victim));
                        }
                        self.store.remove_entry(txn, tgt_parent, &tgt_name)?;
                        self.touch_dir(txn, tgt_parent, -i32::from(victim_is_dir), now)?;
                        Some(self.drop_link(txn, victim, now)?)
                    }
                    None => None,
                };

                self.store.remove_entry(txn, src_parent, &src_name)?;
                self.store.insert_entry(txn, tgt_parent, &tgt_name, source, src_kind)?;
                let moved_dir = src_is_dir && src_parent != tgt_parent;
                self.touch_dir(txn, src_parent, -i32::from(moved_dir), now)?;
                self.touch_dir(txn, tgt_parent, i32::from(moved_dir), now)?;
                src_attrs.ctime = now;
                self.store.put_inode(txn, src_attrs)?;
                Ok(removed)
            })
        }
        .await;
        self.unlock(held);
        result
    }

    fn read_page(&self, fid: Fid, page: u64) -> SimResult<Reply> {
        self.dir_attrs(fid)?;
        let (entries, last) = self.store.read_page(fid, page)?;
        Ok(Reply::Page { entries, last })
    }

    async fn execute(&self, request: Request) -> SimResult<Reply> {
        match request {
            Request::Connect { client } => {
                debug!(mds = %self.name, %client, "Client connected");
                Ok(Reply::Connected {
                    cookie: self.next_cookie.fetch_add(1, Ordering::Relaxed),
                })
            }
            Request::Disconnect { .. } => Ok(Reply::Done),
            Request::GetStatus => Ok(Reply::Status { root: self.root }),
            Request::Getattr { fid, valid } => Ok(Reply::Body(self.body(fid, valid)?)),
            Request::Lookup { parent, name, valid } => {
                self.dir_attrs(parent)?;
                let fid = self
                    .store
                    .lookup(parent, &name)?
                    .ok_or(SimError::NoEntry { dir: parent, name })?;
                Ok(Reply::Body(self.body(fid, valid)?))
            }
            Request::Create {
                parent,
                name,
                mode,
                uid,
                gid,
                rdev,
                target,
                stripe,
            } => Ok(Reply::Body(
                self.create(parent, name, mode, uid, gid, rdev, target, stripe)
                    .await?,
            )),
            Request::Setattr { fid, attr } => Ok(Reply::Body(self.setattr(fid, attr).await?)),
            Request::SetStripe { fid, stripe } => Ok(Reply::Body(self.set_stripe(fid, stripe).await?)),
            Request::Link { fid, parent, name } => Ok(Reply::Body(self.link(fid, parent, name).await?)),
            Request::Unlink { parent, name, kind } => Ok(Reply::Removed(self.unlink(parent, name, kind).await?)),
            Request::Rename {
                src_parent,
                src_name,
                tgt_parent,
                tgt_name,
            } => Ok(Reply::Removed(
                self.rename(src_parent, src_name, tgt_parent, tgt_name)
                    .await?,
            )),
            Request::ReadPage { fid, page } => self.read_page(fid, page),
            Request::Statfs => Ok(Reply::Statfs(self.store.statfs())),
            other => Err(SimError::Invalid(format!(
                "{:?} sent to the metadata server",
                other.opcode()
            ))),
        }
    }
}

#[async_trait]
impl SimService for MetadataServer {
    #[instrument(level = "trace", skip_all, fields(mds = %self.name, op = ?request.opcode()))]
    async fn handle(&self, request: Request) -> Reply {
        match self.execute(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(mds = %self.name, error = %e, "Request failed");
                Reply::Error { errno: e.to_errno() }
            }
        }
    }
}
