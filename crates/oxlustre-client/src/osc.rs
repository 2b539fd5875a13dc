//! Storage target client: object operations against one target.

use crate::error::ClientResult;
use crate::obd::{CreateSpec, ExportHandle, Import, IoOp, ObdOps, Prepared};
use async_trait::async_trait;
use oxlustre_core::transport::{Endpoint, ImportEvent, RetryPolicy, Transport};
use oxlustre_core::{AttrValid, ObdStatfs, ObjectId, Reply, Request, SetAttr, WireAttrs};
use oxlustre_dlm::EOF;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug)]
pub struct OscClient {
    /// Target index as recorded in stripe metadata.
    index: u32,
    import: Import,
    /// Staging tokens; randomly based so clients sharing a target do not collide.
    next_token: AtomicU64,
}

impl OscClient {
    pub fn new(index: u32, transport: Arc<dyn Transport>, endpoint: Endpoint, policy: RetryPolicy) -> Self {
        Self {
            index,
            import: Import::new(transport, endpoint, policy),
            next_token: AtomicU64::new(Uuid::new_v4().as_u64_pair().0),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn object_attrs(&self, reply: Reply) -> ClientResult<(ObjectId, WireAttrs)> {
        match reply {
            Reply::Object { object, attrs } => Ok((object, attrs)),
            other => Err(self.import.unexpected("object", &other)),
        }
    }
}

#[async_trait]
impl ObdOps for OscClient {
    type Key = ObjectId;

    fn name(&self) -> &str {
        self.import.target()
    }

    async fn connect(&self, client: Uuid) -> ClientResult<ExportHandle> {
        self.import.connect(client).await
    }

    async fn disconnect(&self) -> ClientResult<()> {
        self.import.disconnect().await
    }

    async fn getattr(&self, key: &ObjectId, valid: AttrValid) -> ClientResult<WireAttrs> {
        let reply = self
            .import
            .call(&Request::ObjGetattr { object: *key, valid })
            .await?;
        Ok(self.object_attrs(reply)?.1)
    }

    async fn setattr(&self, key: &ObjectId, attr: &SetAttr) -> ClientResult<WireAttrs> {
        let reply = self
            .import
            .call(&Request::ObjSetattr {
                object: *key,
                attr: *attr,
            })
            .await?;
        Ok(self.object_attrs(reply)?.1)
    }

    async fn create(&self, spec: &CreateSpec) -> ClientResult<ObjectId> {
        let reply = self.import.call(&Request::ObjCreate { group: spec.group }).await?;
        Ok(self.object_attrs(reply)?.0)
    }

    async fn destroy(&self, key: &ObjectId) -> ClientResult<()> {
        match self.import.call(&Request::ObjDestroy { object: *key }).await? {
            Reply::Done => Ok(()),
            other => Err(self.import.unexpected("done", &other)),
        }
    }

    async fn punch(&self, key: &ObjectId, start: u64) -> ClientResult<()> {
        let request = Request::ObjPunch {
            object: *key,
            start,
            end: EOF,
        };
        match self.import.call(&request).await? {
            Reply::Done => Ok(()),
            other => Err(self.import.unexpected("done", &other)),
        }
    }

    async fn prep_rw(&self, key: &ObjectId, op: IoOp) -> ClientResult<Prepared> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let request = match op {
            IoOp::Read { offset, len } => Request::PrepRead {
                token,
                object: *key,
                offset,
                len,
            },
            IoOp::Write { offset, data } => Request::PrepWrite {
                token,
                object: *key,
                offset,
                data,
            },
        };
        match self.import.call(&request).await? {
            Reply::Prepared { token, data } => Ok(Prepared { token, data }),
            other => Err(self.import.unexpected("prepared", &other)),
        }
    }

    async fn commit_rw(&self, _key: &ObjectId, token: u64) -> ClientResult<u64> {
        match self.import.call(&Request::Commit { token }).await? {
            Reply::Committed { bytes } => Ok(bytes),
            other => Err(self.import.unexpected("committed", &other)),
        }
    }

    async fn statfs(&self) -> ClientResult<ObdStatfs> {
        self.import.statfs().await
    }

    fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.import.subscribe()
    }
}
