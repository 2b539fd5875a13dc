//! Client errors and their POSIX mapping.
//!
//! Every failure a filesystem operation can report is a [`ClientError`].
//! [`ClientError::to_errno`] gives the code handed back to the caller, and
//! [`ErrorCategory`] classifies it for logging and tests.

use oxlustre_core::{Fid, RpcError, StripeError};
use oxlustre_dlm::DlmError;
use std::fmt;
use thiserror::Error;

/// Semantic category of a client error.
///
/// # Example
///
/// ```
/// use oxlustre_client::ErrorCategory;
///
/// let category = ErrorCategory::from_errno(libc::ENOENT);
/// assert_eq!(category, ErrorCategory::NotFound);
/// assert_eq!(category.to_errno(), libc::ENOENT);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Exists,
    NotEmpty,
    IsDir,
    NotDir,
    Invalid,
    /// EACCES or EPERM, passed through unchanged.
    Permission,
    TooManyLinks,
    TooBig,
    WouldBlock,
    Timeout,
    /// Malformed reply, missing validity bits, stripe metadata mismatch.
    Protocol,
    BadDescriptor,
    NotSupported,
    Io,
}

impl ErrorCategory {
    /// Classify a POSIX errno.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => Self::NotFound,
            libc::EEXIST => Self::Exists,
            libc::ENOTEMPTY => Self::NotEmpty,
            libc::EISDIR => Self::IsDir,
            libc::ENOTDIR => Self::NotDir,
            libc::EINVAL | libc::ENAMETOOLONG => Self::Invalid,
            libc::EACCES | libc::EPERM => Self::Permission,
            libc::EMLINK => Self::TooManyLinks,
            libc::EFBIG => Self::TooBig,
            libc::EAGAIN => Self::WouldBlock,
            libc::ETIMEDOUT => Self::Timeout,
            libc::EPROTO => Self::Protocol,
            libc::EBADF => Self::BadDescriptor,
            libc::ENOSYS | libc::ENOTSUP => Self::NotSupported,
            _ => Self::Io,
        }
    }

    /// Canonical errno of the category.
    #[inline]
    pub fn to_errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::IsDir => libc::EISDIR,
            Self::NotDir => libc::ENOTDIR,
            Self::Invalid => libc::EINVAL,
            Self::Permission => libc::EACCES,
            Self::TooManyLinks => libc::EMLINK,
            Self::TooBig => libc::EFBIG,
            Self::WouldBlock => libc::EAGAIN,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Protocol => libc::EPROTO,
            Self::BadDescriptor => libc::EBADF,
            Self::NotSupported => libc::ENOSYS,
            Self::Io => libc::EIO,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Exists => "Exists",
            Self::NotEmpty => "NotEmpty",
            Self::IsDir => "IsDir",
            Self::NotDir => "NotDir",
            Self::Invalid => "Invalid",
            Self::Permission => "Permission",
            Self::TooManyLinks => "TooManyLinks",
            Self::TooBig => "TooBig",
            Self::WouldBlock => "WouldBlock",
            Self::Timeout => "Timeout",
            Self::Protocol => "Protocol",
            Self::BadDescriptor => "BadDescriptor",
            Self::NotSupported => "NotSupported",
            Self::Io => "Io",
        }
    }
}

/// One failed stripe of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeFailure {
    pub stripe: usize,
    pub target: u32,
    pub error: Box<ClientError>,
}

/// Outcome of a fan-out where some stripes failed.
///
/// Peers are never cancelled, so `completed` lists every stripe whose
/// operation did take effect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialFailure {
    pub completed: Vec<usize>,
    pub failed: Vec<StripeFailure>,
}

impl PartialFailure {
    /// True when no stripe succeeded.
    pub fn is_total(&self) -> bool {
        self.completed.is_empty()
    }

    /// Shared errno of the failures, or EIO when they disagree.
    pub fn errno(&self) -> i32 {
        let mut codes = self.failed.iter().map(|f| f.error.to_errno());
        match codes.next() {
            Some(first) if codes.all(|c| c == first) => first,
            _ => libc::EIO,
        }
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} stripes failed",
            self.failed.len(),
            self.failed.len() + self.completed.len()
        )?;
        for failure in &self.failed {
            write!(
                f,
                "; stripe {} (target {}): {}",
                failure.stripe, failure.target, failure.error
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("lock error: {0}")]
    Lock(#[from] DlmError),

    #[error("bad stripe metadata: {0}")]
    Stripe(#[from] StripeError),

    /// A reply carried stripe metadata that disagrees with the cached layout.
    #[error("stripe metadata of {fid} changed shape")]
    StripeMismatch { fid: Fid },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("partial failure: {0}")]
    PartialFailure(#[from] PartialFailure),

    /// The namespace entry is gone but its storage objects could not be destroyed.
    #[error("{fid} unlinked but its objects were not destroyed: {source}")]
    OrphanedObjects {
        fid: Fid,
        #[source]
        source: Box<ClientError>,
    },

    /// A POSIX error detected locally.
    #[error("{op}: errno {errno}")]
    Errno { op: &'static str, errno: i32 },

    #[error("bad file descriptor {0}")]
    BadDescriptor(u64),

    #[error("{0} not supported")]
    NotSupported(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session is unmounted")]
    Unmounted,
}

impl ClientError {
    pub fn errno(op: &'static str, errno: i32) -> Self {
        Self::Errno { op, errno }
    }

    /// The code handed back to the caller.
    ///
    /// Remote permission errors come back unchanged.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Rpc(e) => e.errno(),
            Self::Lock(e) => e.to_errno(),
            Self::Stripe(_) | Self::StripeMismatch { .. } | Self::Protocol(_) => libc::EPROTO,
            Self::PartialFailure(p) => p.errno(),
            Self::OrphanedObjects { .. } | Self::Unmounted => libc::EIO,
            Self::Errno { errno, .. } => *errno,
            Self::BadDescriptor(_) => libc::EBADF,
            Self::NotSupported(_) => libc::ENOSYS,
            Self::Config(_) => libc::EINVAL,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from_errno(self.to_errno())
    }

    /// True for errors that mean the peers disagree on the protocol.
    pub fn is_protocol(&self) -> bool {
        self.category() == ErrorCategory::Protocol
    }

    pub fn is_not_found(&self) -> bool {
        self.to_errno() == libc::ENOENT
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use oxlustre_core::TransportError;

    fn remote(errno: i32) -> ClientError {
        ClientError::Rpc(RpcError::Remote {
            target: "mds".into(),
            errno,
        })
    }

    #[test]
    fn test_permission_errors_verbatim() {
        assert_eq!(remote(libc::EPERM).to_errno(), libc::EPERM);
        assert_eq!(remote(libc::EACCES).to_errno(), libc::EACCES);
        assert_eq!(remote(libc::EPERM).category(), ErrorCategory::Permission);
    }

    #[test]
    fn test_protocol_errors() {
        let e = ClientError::StripeMismatch {
            fid: Fid::new(7, 1, 0),
        };
        assert_eq!(e.to_errno(), libc::EPROTO);
        assert!(e.is_protocol());
        assert!(ClientError::from(StripeError::BadMagic { found: 0 }).is_protocol());
    }

    #[test]
    fn test_category_round_trip() {
        for errno in [
            libc::ENOENT,
            libc::EEXIST,
            libc::ENOTEMPTY,
            libc::EMLINK,
            libc::EFBIG,
            libc::EAGAIN,
            libc::ETIMEDOUT,
            libc::EBADF,
        ] {
            assert_eq!(ErrorCategory::from_errno(errno).to_errno(), errno);
        }
        assert_eq!(ErrorCategory::from_errno(libc::ENOSPC), ErrorCategory::Io);
    }

    #[test]
    fn test_partial_failure_errno() {
        let timeout = ClientError::Rpc(RpcError::Transport {
            target: "ost2".into(),
            source: TransportError::Timeout,
        });
        let mut pf = PartialFailure {
            completed: vec![0, 1],
            failed: vec![StripeFailure {
                stripe: 2,
                target: 2,
                error: Box::new(timeout),
            }],
        };
        assert!(!pf.is_total());
        assert_eq!(pf.errno(), libc::ETIMEDOUT);
        assert!(pf.to_string().contains("stripe 2 (target 2)"));

        pf.failed.push(StripeFailure {
            stripe: 0,
            target: 0,
            error: Box::new(remote(libc::ENOSPC)),
        });
        assert_eq!(pf.errno(), libc::EIO);
    }

    #[test]
    fn test_orphaned_objects_reports_source() {
        let e = ClientError::OrphanedObjects {
            fid: Fid::new(3, 0, 0),
            source: Box::new(remote(libc::EIO)),
        };
        assert_eq!(e.category(), ErrorCategory::Io);
        assert!(std::error::Error::source(&e).is_some());
    }
}
