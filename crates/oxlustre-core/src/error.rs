//! Error types for the protocol layer.

use thiserror::Error;

/// Failure of the transport to deliver a request or its reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection lost")]
    ConnectionLost,

    /// The peer rejected the request with a POSIX error code.
    #[error("remote error {0}")]
    Remote(i32),
}

/// Message encoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Failure of a single RPC after retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("{target}: {source}")]
    Transport {
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("{target}: server returned errno {errno}")]
    Remote { target: String, errno: i32 },

    #[error("malformed message: {0}")]
    Codec(#[from] CodecError),

    #[error("{target}: unexpected {got} reply, expected {expected}")]
    UnexpectedReply {
        target: String,
        expected: &'static str,
        got: &'static str,
    },
}

impl RpcError {
    /// POSIX error code for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Transport {
                source: TransportError::Timeout,
                ..
            } => libc::ETIMEDOUT,
            Self::Transport {
                source: TransportError::ConnectionLost,
                ..
            } => libc::ENOTCONN,
            Self::Transport {
                source: TransportError::Remote(errno),
                ..
            }
            | Self::Remote { errno, .. } => *errno,
            Self::Codec(_) | Self::UnexpectedReply { .. } => libc::EPROTO,
        }
    }

    /// True when the server answered with `errno`.
    pub fn is_remote(&self, errno: i32) -> bool {
        matches!(self, Self::Remote { errno: e, .. } if *e == errno)
    }

    /// Protocol violations are fatal and never retried.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Codec(_) | Self::UnexpectedReply { .. })
    }
}
