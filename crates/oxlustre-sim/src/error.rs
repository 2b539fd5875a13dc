//! Errors raised inside the simulated services.
//!
//! They never cross the network as values: the services turn them into
//! `Reply::Error { errno }` with [`SimError::to_errno`].

use oxlustre_core::{Fid, ObjectId, StripeError};
use oxlustre_dlm::DlmError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("no inode {0}")]
    NoInode(Fid),

    #[error("no object {0}")]
    NoObject(ObjectId),

    #[error("no entry {name:?} in {dir}")]
    NoEntry { dir: Fid, name: String },

    #[error("{name:?} already exists in {dir}")]
    Exists { dir: Fid, name: String },

    #[error("{0} already has stripe metadata")]
    StripeExists(Fid),

    #[error("directory {0} is not empty")]
    NotEmpty(Fid),

    #[error("{0} is not a directory")]
    NotDir(Fid),

    #[error("{0} is a directory")]
    IsDir(Fid),

    #[error("out of space")]
    NoSpace,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    #[error("no transaction is open")]
    NoTransaction,

    #[error("server lock failed: {0}")]
    Lock(#[from] DlmError),

    #[error(transparent)]
    Stripe(#[from] StripeError),
}

impl SimError {
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NoInode(_) | Self::NoObject(_) | Self::NoEntry { .. } => libc::ENOENT,
            Self::Exists { .. } | Self::StripeExists(_) => libc::EEXIST,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::NotDir(_) => libc::ENOTDIR,
            Self::IsDir(_) => libc::EISDIR,
            Self::NoSpace => libc::ENOSPC,
            Self::Invalid(_) => libc::EINVAL,
            Self::NotPermitted(_) => libc::EPERM,
            Self::NoTransaction | Self::Lock(_) => libc::EIO,
            Self::Stripe(_) => libc::EPROTO,
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let fid = Fid::new(5, 1, 0);
        assert_eq!(SimError::NoInode(fid).to_errno(), libc::ENOENT);
        assert_eq!(SimError::NotEmpty(fid).to_errno(), libc::ENOTEMPTY);
        assert_eq!(SimError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(
            SimError::Exists {
                dir: fid,
                name: "a".into()
            }
            .to_errno(),
            libc::EEXIST
        );
    }
}
