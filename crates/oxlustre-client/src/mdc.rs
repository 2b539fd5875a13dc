//! Metadata client.
//!
//! Namespace operations against the metadata service. Replies are returned
//! as raw [`MdBody`]s; merging them into the inode cache is the caller's job.

use crate::error::{ClientError, ClientResult};
use crate::obd::{ExportHandle, Import, ObdOps};
use async_trait::async_trait;
use bytes::Bytes;
use oxlustre_core::stripe::StripeMd;
use oxlustre_core::transport::{Endpoint, ImportEvent, RetryPolicy, Transport};
use oxlustre_core::{AttrValid, DirEntry, Fid, MdBody, ObdStatfs, Reply, Request, SetAttr, WireAttrs};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::instrument;
use uuid::Uuid;

/// A namespace entry to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub parent: Fid,
    pub name: String,
    /// Full mode including the type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    /// Target of a symlink.
    pub target: Option<String>,
    pub stripe: Option<Bytes>,
}

#[derive(Debug)]
pub struct MdcClient {
    import: Import,
}

impl MdcClient {
    pub fn new(transport: Arc<dyn Transport>, endpoint: Endpoint, policy: RetryPolicy) -> Self {
        Self {
            import: Import::new(transport, endpoint, policy),
        }
    }

    fn body(&self, reply: Reply) -> ClientResult<MdBody> {
        match reply {
            Reply::Body(body) => Ok(body),
            other => Err(self.import.unexpected("body", &other)),
        }
    }

    fn removed(&self, reply: Reply) -> ClientResult<Option<MdBody>> {
        match reply {
            Reply::Removed(body) => Ok(body),
            other => Err(self.import.unexpected("removed", &other)),
        }
    }

    /// Fid of the filesystem root.
    pub async fn get_status(&self) -> ClientResult<Fid> {
        match self.import.call(&Request::GetStatus).await? {
            Reply::Status { root } => Ok(root),
            other => Err(self.import.unexpected("status", &other)),
        }
    }

    /// Getattr that may also return the stripe EA and the symlink target.
    #[instrument(level = "debug", skip(self), fields(%fid))]
    pub async fn getattr_full(&self, fid: Fid, valid: AttrValid) -> ClientResult<MdBody> {
        let reply = self.import.call(&Request::Getattr { fid, valid }).await?;
        self.body(reply)
    }

    #[instrument(level = "debug", skip(self), fields(%parent))]
    pub async fn lookup(&self, parent: Fid, name: &str, valid: AttrValid) -> ClientResult<MdBody> {
        let reply = self
            .import
            .call(&Request::Lookup {
                parent,
                name: name.to_string(),
                valid,
            })
            .await?;
        self.body(reply)
    }

    #[instrument(level = "debug", skip(self, spec), fields(parent = %spec.parent, name = %spec.name))]
    pub async fn create_node(&self, spec: NodeSpec) -> ClientResult<MdBody> {
        let reply = self
            .import
            .call(&Request::Create {
                parent: spec.parent,
                name: spec.name,
                mode: spec.mode,
                uid: spec.uid,
                gid: spec.gid,
                rdev: spec.rdev,
                target: spec.target,
                stripe: spec.stripe,
            })
            .await?;
        self.body(reply)
    }

    pub async fn setattr_full(&self, fid: Fid, attr: &SetAttr) -> ClientResult<MdBody> {
        let reply = self.import.call(&Request::Setattr { fid, attr: *attr }).await?;
        self.body(reply)
    }

    /// Record freshly allocated stripe metadata on a file.
    pub async fn set_stripe(&self, fid: Fid, md: &StripeMd) -> ClientResult<MdBody> {
        let reply = self
            .import
            .call(&Request::SetStripe {
                fid,
                stripe: md.to_bytes(),
            })
            .await?;
        self.body(reply)
    }

    pub async fn link(&self, fid: Fid, parent: Fid, name: &str) -> ClientResult<MdBody> {
        let reply = self
            .import
            .call(&Request::Link {
                fid,
                parent,
                name: name.to_string(),
            })
            .await?;
        self.body(reply)
    }

    /// Remove a name. `kind` is the expected type bits (`S_IFDIR` for rmdir, 0 otherwise).
    ///
    /// The reply describes the removed inode; it carries the stripe EA when
    /// the last link went away.
    #[instrument(level = "debug", skip(self), fields(%parent))]
    pub async fn unlink(&self, parent: Fid, name: &str, kind: u32) -> ClientResult<Option<MdBody>> {
        let reply = self
            .import
            .call(&Request::Unlink {
                parent,
                name: name.to_string(),
                kind,
            })
            .await?;
        self.removed(reply)
    }

    /// Rename; the reply describes an overwritten target, if any.
    pub async fn rename(
        &self,
        src_parent: Fid,
        src_name: &str,
        tgt_parent: Fid,
        tgt_name: &str,
    ) -> ClientResult<Option<MdBody>> {
        let reply = self
            .import
            .call(&Request::Rename {
                src_parent,
                src_name: src_name.to_string(),
                tgt_parent,
                tgt_name: tgt_name.to_string(),
            })
            .await?;
        self.removed(reply)
    }

    /// Read every page of a directory.
    pub async fn readdir(&self, fid: Fid) -> ClientResult<Vec<DirEntry>> {
        let mut out = Vec::new();
        let mut page = 0;
        loop {
            match self.import.call(&Request::ReadPage { fid, page }).await? {
                Reply::Page { entries, last } => {
                    out.extend(entries);
                    if last {
                        return Ok(out);
                    }
                    page += 1;
                }
                other => return Err(self.import.unexpected("page", &other)),
            }
        }
    }
}

#[async_trait]
impl ObdOps for MdcClient {
    type Key = Fid;

    fn name(&self) -> &str {
        self.import.target()
    }

    async fn connect(&self, client: Uuid) -> ClientResult<ExportHandle> {
        self.import.connect(client).await
    }

    async fn disconnect(&self) -> ClientResult<()> {
        self.import.disconnect().await
    }

    async fn getattr(&self, key: &Fid, valid: AttrValid) -> ClientResult<WireAttrs> {
        Ok(self.getattr_full(*key, valid).await?.attrs)
    }

    async fn setattr(&self, key: &Fid, attr: &SetAttr) -> ClientResult<WireAttrs> {
        Ok(self.setattr_full(*key, attr).await?.attrs)
    }

    async fn create(&self, _spec: &crate::obd::CreateSpec) -> ClientResult<Fid> {
        // Namespace creates need a parent and a name
        Err(ClientError::NotSupported("metadata object create"))
    }

    async fn statfs(&self) -> ClientResult<ObdStatfs> {
        self.import.statfs().await
    }

    fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.import.subscribe()
    }
}
