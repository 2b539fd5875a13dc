//! Lock manager errors.

use crate::mode::LockMode;
use crate::resource::{ClientId, LockCookie, ResourceId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DlmError {
    /// A non-blocking request found a conflicting lock.
    #[error("lock on {resource} would block")]
    WouldBlock { resource: ResourceId },

    /// A pending request was cancelled by the server before it could be granted.
    #[error("lock request on {resource} cancelled by server")]
    Cancelled { resource: ResourceId },

    /// The client was evicted from the namespace; all its locks are gone.
    #[error("client {client} evicted from {namespace}")]
    Evicted { client: ClientId, namespace: String },

    #[error("unknown lock {0}")]
    UnknownLock(LockCookie),

    #[error("cannot convert {from} lock to {to}")]
    InvalidConversion { from: LockMode, to: LockMode },

    #[error("lock namespace {0} is shut down")]
    Shutdown(String),
}

impl DlmError {
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::WouldBlock { .. } => libc::EAGAIN,
            Self::Cancelled { .. } => libc::EINTR,
            Self::Evicted { .. } | Self::Shutdown(_) => libc::EIO,
            Self::UnknownLock(_) => libc::ENOLCK,
            Self::InvalidConversion { .. } => libc::EINVAL,
        }
    }
}

pub type DlmResult<T> = Result<T, DlmError>;
