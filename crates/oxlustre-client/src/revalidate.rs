//! Revalidation: deciding whether cached attributes can be trusted, and
//! refreshing them when they cannot.
//!
//! Cached attributes are valid exactly as long as this client holds a PR (or
//! stronger) UPDATE lock on the inode. Without one, attributes are refetched
//! from the metadata service under such a lock; concurrent callers for the
//! same fid share one RPC. For striped files the size and times then come
//! from the storage targets.

use crate::error::{ClientError, ClientResult};
use crate::inode::{Inode, InodeStatus};
use crate::obd::ObdOps;
use crate::session::Session;
use oxlustre_core::{AttrValid, FileType};
use oxlustre_dlm::{InodeBits, LockFlags, LockMode, Policy, ResourceId};
use std::sync::Arc;
use tracing::{debug, error};

fn update_policy() -> Policy {
    Policy::InodeBits(InodeBits::UPDATE)
}

impl Session {
    /// Make the cached attributes of `inode` current.
    pub async fn revalidate(&self, inode: &Arc<Inode>) -> ClientResult<()> {
        inode.drain_notices();
        let fid = inode.fid();
        let resource = ResourceId::from_fid(fid);
        let hit = inode.status() == InodeStatus::Populated
            && self.md_locks.test_lock(resource, LockMode::Pr, &update_policy());
        self.stats.record_revalidate(hit);

        if hit {
            debug!(%fid, "Revalidate hit");
        } else {
            debug!(%fid, status = ?inode.status(), "Revalidate miss");
            self.getattr_flights
                .run(fid, || self.fetch_attrs(inode))
                .await?;
        }

        if inode.stripe().is_some() {
            self.glimpse(inode).await?;
        }
        Ok(())
    }

    /// Getattr from the metadata service under a PR UPDATE lock.
    async fn fetch_attrs(&self, inode: &Arc<Inode>) -> ClientResult<()> {
        let fid = inode.fid();
        let lock = self
            .md_locks
            .acquire(
                ResourceId::from_fid(fid),
                LockMode::Pr,
                update_policy(),
                LockFlags::empty(),
                Some(inode.sink()),
            )
            .await?;

        let mut valid = AttrValid::BASIC;
        if inode.file_type() == Some(FileType::Regular) && inode.stripe().is_none() {
            valid |= AttrValid::EASIZE;
        }
        self.stats.record_getattr_rpc();
        let merged = match self.mdc.getattr_full(fid, valid).await {
            Ok(body) => inode.merge(&body),
            Err(e) => Err(e),
        };
        let released = self.md_locks.release(lock).map_err(ClientError::from);
        merged.and(released)
    }

    /// Size, blocks and times of a striped file from its objects.
    pub(crate) async fn glimpse(&self, inode: &Arc<Inode>) -> ClientResult<()> {
        let Some(md) = inode.stripe() else {
            return Ok(());
        };
        self.stats.record_glimpse();
        let attrs = self.lov.getattr(&md, AttrValid::STORAGE).await?;
        inode.merge_storage(&attrs);
        Ok(())
    }

    /// Target of a symlink, fetched at most once per inode.
    pub(crate) async fn symlink_target(&self, inode: &Arc<Inode>) -> ClientResult<String> {
        let fid = inode.fid();
        let target = inode
            .symlink_cell()
            .get_or_try_init(|| async {
                self.stats.record_readlink_rpc();
                let body = self
                    .mdc
                    .getattr_full(fid, AttrValid::BASIC | AttrValid::LINKNAME)
                    .await?;
                let name = match body.linkname {
                    Some(name) if body.attrs.valid.contains(AttrValid::LINKNAME) => name,
                    _ => {
                        error!(%fid, "Link name missing from reply");
                        return Err(ClientError::Protocol(format!("{fid}: reply lacks link name")));
                    }
                };
                let expected = inode.size();
                if name.len() as u64 != expected {
                    error!(%fid, got = name.len(), expected, "Symlink length mismatch");
                    return Err(ClientError::Protocol(format!(
                        "{fid}: link name is {} bytes, expected {expected}",
                        name.len()
                    )));
                }
                Ok(name)
            })
            .await?;
        Ok(target.clone())
    }
}
