//! The lock service interface between lock clients and a lock namespace.

use crate::error::DlmResult;
use crate::mode::LockMode;
use crate::policy::Policy;
use crate::resource::{ClientId, LockCookie, ResourceId};
use async_trait::async_trait;
use bitflags::bitflags;
use tokio::sync::mpsc;

bitflags! {
    /// Request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LockFlags: u32 {
        /// Fail with `WouldBlock` instead of waiting.
        const BLOCK_NOWAIT = 1 << 0;
        /// Cached data under the lock may be dropped instead of flushed on revocation.
        const DISCARD_DATA = 1 << 1;
    }
}

impl Default for LockFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub cookie: LockCookie,
    pub resource: ResourceId,
    pub mode: LockMode,
    pub policy: Policy,
    pub flags: LockFlags,
}

/// A granted lock as reported by the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub cookie: LockCookie,
    pub mode: LockMode,
    pub policy: Policy,
}

/// Server-to-client callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// Another request conflicts with this lock: cancel it as soon as it is unused.
    Blocking {
        cookie: LockCookie,
        resource: ResourceId,
    },
    /// The server dropped this lock (eviction or resource cleanup).
    Revoked {
        cookie: LockCookie,
        resource: ResourceId,
    },
}

/// A lock namespace as seen by its clients.
#[async_trait]
pub trait LockService: Send + Sync {
    fn name(&self) -> &str;

    /// Register a client. Callbacks for its locks arrive on the returned channel.
    fn connect(&self, client: ClientId) -> mpsc::UnboundedReceiver<ServerEvent>;

    /// Unregister a client, dropping whatever locks it still holds.
    fn disconnect(&self, client: ClientId);

    /// Request a lock, waiting for conflicting holders unless `BLOCK_NOWAIT` is set.
    async fn enqueue(&self, request: EnqueueRequest) -> DlmResult<Grant>;

    /// Cancel a granted lock or withdraw a pending request.
    fn cancel(&self, cookie: LockCookie) -> DlmResult<()>;

    /// Downgrade a granted lock.
    fn convert(&self, cookie: LockCookie, mode: LockMode) -> DlmResult<()>;
}
