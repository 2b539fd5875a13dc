//! The object-device capability interface.
//!
//! Every backend the client talks to (the metadata client, one storage
//! target client per target, and the striping layer over them) implements
//! [`ObdOps`]. Capabilities a backend lacks return
//! [`ClientError::NotSupported`].

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use bytes::Bytes;
use oxlustre_core::transport::{Endpoint, ImportEvent, ImportState, RetryPolicy, RpcClient, Transport};
use oxlustre_core::{AttrValid, ObdStatfs, Reply, Request, RpcError, SetAttr, WireAttrs};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Connection-scoped handle returned by `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportHandle {
    pub cookie: u64,
    pub target: String,
}

/// Template for allocating storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateSpec {
    pub group: u64,
    pub stripe_count: u32,
    pub stripe_size: u64,
}

/// First phase of a two-phase transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOp {
    Read { offset: u64, len: u64 },
    Write { offset: u64, data: Bytes },
}

/// A staged transfer, committed with [`ObdOps::commit_rw`].
///
/// For reads `data` holds what was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub token: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait ObdOps: Send + Sync {
    /// What names an object on this device.
    type Key: Send + Sync;

    fn name(&self) -> &str;

    async fn connect(&self, client: Uuid) -> ClientResult<ExportHandle>;

    async fn disconnect(&self) -> ClientResult<()>;

    /// Fetch the attributes named in `valid`.
    async fn getattr(&self, key: &Self::Key, valid: AttrValid) -> ClientResult<WireAttrs>;

    /// Apply exactly the fields `attr` marks valid.
    async fn setattr(&self, key: &Self::Key, attr: &SetAttr) -> ClientResult<WireAttrs>;

    async fn create(&self, _spec: &CreateSpec) -> ClientResult<Self::Key> {
        Err(ClientError::NotSupported("create"))
    }

    async fn destroy(&self, _key: &Self::Key) -> ClientResult<()> {
        Err(ClientError::NotSupported("destroy"))
    }

    /// Drop data from `start` to the end of the object.
    async fn punch(&self, _key: &Self::Key, _start: u64) -> ClientResult<()> {
        Err(ClientError::NotSupported("punch"))
    }

    async fn prep_rw(&self, _key: &Self::Key, _op: IoOp) -> ClientResult<Prepared> {
        Err(ClientError::NotSupported("prep_rw"))
    }

    /// Commit a staged transfer. Returns the bytes moved.
    async fn commit_rw(&self, _key: &Self::Key, _token: u64) -> ClientResult<u64> {
        Err(ClientError::NotSupported("commit_rw"))
    }

    async fn statfs(&self) -> ClientResult<ObdStatfs>;

    /// Connection state changes of the device.
    fn subscribe(&self) -> broadcast::Receiver<ImportEvent>;
}

/// One connection to a remote service: RPC client plus export handle.
#[derive(Debug)]
pub(crate) struct Import {
    rpc: RpcClient,
    export: Mutex<Option<ExportHandle>>,
}

impl Import {
    pub(crate) fn new(transport: Arc<dyn Transport>, endpoint: Endpoint, policy: RetryPolicy) -> Self {
        Self {
            rpc: RpcClient::new(transport, endpoint, policy),
            export: Mutex::new(None),
        }
    }

    pub(crate) fn target(&self) -> &str {
        self.rpc.target()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.rpc.subscribe()
    }

    pub(crate) async fn call(&self, request: &Request) -> ClientResult<Reply> {
        if self.rpc.state() == ImportState::Closed {
            return Err(ClientError::Unmounted);
        }
        Ok(self.rpc.call(request).await?)
    }

    pub(crate) async fn connect(&self, client: Uuid) -> ClientResult<ExportHandle> {
        match self.call(&Request::Connect { client }).await? {
            Reply::Connected { cookie } => {
                let handle = ExportHandle {
                    cookie,
                    target: self.target().to_string(),
                };
                debug!(target_name = %self.target(), cookie, "Connected");
                *self.export.lock() = Some(handle.clone());
                Ok(handle)
            }
            other => Err(self.unexpected("connected", &other)),
        }
    }

    /// Invalidate the export handle and close the connection.
    pub(crate) async fn disconnect(&self) -> ClientResult<()> {
        let export = self.export.lock().take();
        let result = match export {
            Some(handle) => self
                .call(&Request::Disconnect {
                    cookie: handle.cookie,
                })
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        self.rpc.close();
        result
    }

    pub(crate) async fn statfs(&self) -> ClientResult<ObdStatfs> {
        match self.call(&Request::Statfs).await? {
            Reply::Statfs(osfs) => Ok(osfs),
            other => Err(self.unexpected("statfs", &other)),
        }
    }

    pub(crate) fn unexpected(&self, expected: &'static str, got: &Reply) -> ClientError {
        ClientError::Rpc(RpcError::UnexpectedReply {
            target: self.target().to_string(),
            expected,
            got: got.kind(),
        })
    }
}
